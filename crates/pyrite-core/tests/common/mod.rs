use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use pyrite_core::cartridge::Cartridge;
use pyrite_core::gameboy::GameBoy;
use pyrite_core::serial::TestResult;

static INIT: OnceCell<()> = OnceCell::new();

fn ensure_test_roms() {
    INIT.get_or_init(|| {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("test_roms");
        fs::create_dir_all(&dir).expect("failed to create test_roms directory");

        // ROM binaries are not checked in; fetch the known bundle on demand.
        if dir.join("blargg").exists() {
            return;
        }

        let url = "https://github.com/c-sp/game-boy-test-roms/releases/download/v7.0/game-boy-test-roms-v7.0.zip";
        let resp = reqwest::blocking::get(url).expect("failed to download test roms");
        let status = resp.status();
        if !status.is_success() {
            panic!("failed to download test roms: {status}");
        }
        let bytes = resp.bytes().expect("failed to read rom bytes");
        let reader = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(reader).expect("failed to open zip archive");
        archive.extract(&dir).expect("failed to extract test roms");
    });
}

pub fn roms_dir() -> PathBuf {
    ensure_test_roms();
    Path::new(env!("CARGO_MANIFEST_DIR")).join("test_roms")
}

#[allow(dead_code)]
pub fn rom_path<P: AsRef<Path>>(relative: P) -> PathBuf {
    roms_dir().join(relative)
}

#[allow(dead_code)]
pub fn boot<P: AsRef<Path>>(relative: P) -> GameBoy {
    let rom = fs::read(rom_path(&relative)).expect("rom not found");
    GameBoy::new(Cartridge::load(rom).expect("bad rom image"))
}

/// Run a serial-reporting test ROM to its verdict, with a T-cycle cap.
#[allow(dead_code)]
pub fn run_serial_rom<P: AsRef<Path>>(relative: P, max_cycles: u64) -> TestResult {
    let mut gb = boot(relative);
    while gb.test_result() == TestResult::Running && gb.bus.cycles() < max_cycles {
        gb.step();
    }
    gb.test_result()
}

/// Decode a reference screenshot into RGB triplets.
#[allow(dead_code)]
pub fn load_png_rgb<P: AsRef<Path>>(path: P) -> (u32, u32, Vec<[u8; 3]>) {
    let file = File::open(path.as_ref()).expect("failed to open png");
    let mut decoder = png::Decoder::new(BufReader::new(file));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder.read_info().expect("failed to read png info");
    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).expect("failed to decode png");
    let data = &buf[..info.buffer_size()];

    let pixel_count = (info.width * info.height) as usize;
    let mut pixels = Vec::with_capacity(pixel_count);
    match reader.info().color_type {
        png::ColorType::Rgb => {
            for chunk in data.chunks_exact(3) {
                pixels.push([chunk[0], chunk[1], chunk[2]]);
            }
        }
        png::ColorType::Rgba => {
            for chunk in data.chunks_exact(4) {
                pixels.push([chunk[0], chunk[1], chunk[2]]);
            }
        }
        png::ColorType::Grayscale => {
            for &gray in data {
                pixels.push([gray, gray, gray]);
            }
        }
        png::ColorType::GrayscaleAlpha => {
            for chunk in data.chunks_exact(2) {
                pixels.push([chunk[0], chunk[0], chunk[0]]);
            }
        }
        other => panic!("unexpected png color type {other:?}"),
    }

    (info.width, info.height, pixels)
}
