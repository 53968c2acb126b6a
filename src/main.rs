use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use pyrite_core::cartridge::Cartridge;
use pyrite_core::gameboy::GameBoy;
use pyrite_core::serial::TestResult;

/// Blargg suites the `--test` mode drives, relative to the test-ROM root.
const TEST_ROMS: &[&str] = &[
    "cpu_instrs/individual/01-special.gb",
    "cpu_instrs/individual/02-interrupts.gb",
    "cpu_instrs/individual/03-op sp,hl.gb",
    "cpu_instrs/individual/04-op r,imm.gb",
    "cpu_instrs/individual/05-op rp.gb",
    "cpu_instrs/individual/06-ld r,r.gb",
    "cpu_instrs/individual/07-jr,jp,call,ret,rst.gb",
    "cpu_instrs/individual/08-misc instrs.gb",
    "cpu_instrs/individual/09-op r,r.gb",
    "cpu_instrs/individual/10-bit ops.gb",
    "cpu_instrs/individual/11-op a,(hl).gb",
    "instr_timing/instr_timing.gb",
    "mem_timing/individual/01-read_timing.gb",
    "mem_timing/individual/02-write_timing.gb",
    "mem_timing/individual/03-modify_timing.gb",
    "mem_timing/mem_timing.gb",
];

/// T-cycle cap per test ROM before it is declared failed.
const MAX_TEST_CYCLES: u64 = 200_000_000;

#[derive(Parser)]
#[command(name = "pyrite", about = "Game Boy / Game Boy Color emulator")]
struct Args {
    /// ROM file to boot, or a directory to list.
    path: Option<PathBuf>,

    /// Run the hardware test-ROM suite from this directory and report
    /// pass/fail per ROM.
    #[arg(long, value_name = "DIR")]
    test: Option<PathBuf>,

    /// Stop after this many frames (headless run).
    #[arg(long, default_value_t = 600)]
    frames: u64,

    /// Stop after this many machine cycles instead of counting frames.
    #[arg(long)]
    cycles: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Some(dir) = args.test {
        return run_tests(&dir);
    }

    let path = match args.path {
        Some(p) => p,
        None => {
            eprintln!("usage: pyrite <rom|dir> [--test DIR]");
            return ExitCode::from(1);
        }
    };

    if path.is_dir() {
        return list_roms(&path);
    }

    run_rom(&path, args.frames, args.cycles)
}

/// Headless run: step the core for a bounded number of frames or cycles,
/// then persist battery RAM. Presentation belongs to a frontend crate.
fn run_rom(path: &Path, frames: u64, cycles: Option<u64>) -> ExitCode {
    let cart = match Cartridge::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    if !cart.validate_logo() {
        info!("header logo mismatch (running anyway)");
    }
    if !cart.validate_header_checksum() {
        info!("header checksum mismatch (running anyway)");
    }

    let mut gb = GameBoy::new(cart);
    let mut frames_seen = 0u64;
    let mut cycles_seen = 0u64;

    loop {
        cycles_seen += gb.step() as u64;
        if gb.frame_ready() {
            frames_seen += 1;
        }
        match cycles {
            Some(limit) => {
                if cycles_seen >= limit {
                    break;
                }
            }
            None => {
                if frames_seen >= frames {
                    break;
                }
            }
        }
    }

    info!("ran {frames_seen} frames ({cycles_seen} machine cycles)");
    gb.save_ram();
    ExitCode::SUCCESS
}

fn list_roms(dir: &Path) -> ExitCode {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            error!("failed to read {}: {e}", dir.display());
            return ExitCode::from(1);
        }
    };

    let mut roms: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("gb") | Some("gbc")
            )
        })
        .collect();
    roms.sort();

    if roms.is_empty() {
        println!("no ROMs in {}", dir.display());
    } else {
        for rom in roms {
            println!("{}", rom.display());
        }
    }
    ExitCode::SUCCESS
}

fn run_tests(dir: &Path) -> ExitCode {
    let mut passed = 0;
    let mut failed = 0;

    for test in TEST_ROMS {
        let path = dir.join(test);
        let cart = match Cartridge::from_file(&path) {
            Ok(c) => c,
            Err(_) => {
                println!("{test}: SKIP");
                continue;
            }
        };

        let mut gb = GameBoy::new(cart);
        let mut cycles = 0u64;
        while gb.test_result() == TestResult::Running && cycles < MAX_TEST_CYCLES {
            cycles += gb.step() as u64 * 4;
        }

        if gb.test_result() == TestResult::Passed {
            println!("{test}: PASSED");
            passed += 1;
        } else {
            println!("{test}: FAILED");
            failed += 1;
        }
    }

    println!("\n{passed}/{} passed", passed + failed);
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
