use std::io::{Read, Write};

use crate::bus::Bus;
use crate::cartridge::Cartridge;
use crate::cpu::Cpu;
use crate::joypad::Button;
use crate::serial::TestResult;
use crate::state;

/// A complete machine: CPU plus the bus that owns every peripheral.
///
/// Hosts drive this type exclusively: `step()` in a loop, present the
/// framebuffer on `frame_ready()`, drain `audio_samples()`, and feed button
/// events in.
pub struct GameBoy {
    pub cpu: Cpu,
    pub bus: Bus,
}

impl GameBoy {
    /// Color mode is decided by the cartridge header's CGB flag.
    pub fn new(cart: Cartridge) -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(cart),
        }
    }

    /// Execute one instruction (or one halt/interrupt step); returns the
    /// machine cycles consumed.
    pub fn step(&mut self) -> u32 {
        self.cpu.step(&mut self.bus)
    }

    /// True exactly once per completed frame.
    pub fn frame_ready(&mut self) -> bool {
        self.bus.ppu.frame_ready()
    }

    /// 160x144 pixels: raw 2-bit shades in monochrome mode, ARGB in color
    /// mode.
    pub fn framebuffer(&self) -> &[u32] {
        self.bus.ppu.framebuffer()
    }

    /// Completed mono samples since the last clear.
    pub fn audio_samples(&self) -> &[f32] {
        self.bus.apu.samples()
    }

    pub fn clear_audio_samples(&mut self) {
        self.bus.apu.clear_samples();
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.bus.apu.set_sample_rate(rate);
    }

    pub fn press(&mut self, button: Button) {
        self.bus.joypad.press(button);
    }

    pub fn release(&mut self, button: Button) {
        self.bus.joypad.release(button);
    }

    /// Pass/fail latch driven by serial output from hardware test ROMs.
    pub fn test_result(&self) -> TestResult {
        self.bus.test_result()
    }

    /// Persist battery RAM and RTC. Best effort.
    pub fn save_ram(&mut self) -> bool {
        self.bus.save_cart_ram()
    }

    /// Serialize the complete machine state. Best effort; returns false if
    /// the sink rejects a write.
    pub fn save_state<W: Write>(&self, sink: &mut W) -> bool {
        let result = state::write_header(sink)
            .and_then(|_| self.cpu.save_state(sink))
            .and_then(|_| self.bus.save_state(sink))
            .and_then(|_| self.bus.timer.save_state(sink))
            .and_then(|_| self.bus.ppu.save_state(sink))
            .and_then(|_| self.bus.apu.save_state(sink))
            .and_then(|_| self.bus.cart.save_state(sink));
        result.is_ok()
    }

    /// Restore a state written by [`GameBoy::save_state`]. A magic or
    /// version mismatch returns false before any state is touched.
    pub fn load_state<R: Read>(&mut self, source: &mut R) -> bool {
        match state::read_header(source) {
            Ok(true) => {}
            _ => return false,
        }
        let result = self
            .cpu
            .load_state(source)
            .and_then(|_| self.bus.load_state(source))
            .and_then(|_| self.bus.timer.load_state(source))
            .and_then(|_| self.bus.ppu.load_state(source))
            .and_then(|_| self.bus.apu.load_state(source))
            .and_then(|_| self.bus.cart.load_state(source));
        result.is_ok()
    }
}
