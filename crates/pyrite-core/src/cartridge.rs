use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::state;

const HEADER_END: usize = 0x0150;
const ROM_BANK_SIZE: usize = 0x4000;
const RAM_BANK_SIZE: usize = 0x2000;

const NINTENDO_LOGO: [u8; 48] = [
    0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00,
    0x0D, 0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E, 0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD,
    0xD9, 0x99, 0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB,
    0xB9, 0x33, 0x3E,
];

/// Failure to load a cartridge image.
#[derive(Debug)]
pub enum CartridgeError {
    /// The image is too small to hold the 0x0100-0x014F header.
    TooSmall(usize),
    /// The ROM file could not be read.
    Io(PathBuf, io::Error),
}

impl fmt::Display for CartridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CartridgeError::TooSmall(len) => {
                write!(f, "ROM image is {len} bytes, too small to hold a header")
            }
            CartridgeError::Io(path, e) => write!(f, "failed to read {}: {e}", path.display()),
        }
    }
}

impl std::error::Error for CartridgeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    NoMbc,
    Mbc1,
    Mbc3,
    Mbc5,
}

/// Parsed cartridge header (0x0100-0x014F).
#[derive(Debug, Clone)]
pub struct Header {
    pub entry_point: [u8; 4],
    pub logo: [u8; 48],
    pub title: String,
    pub manufacturer_code: [u8; 4],
    pub cgb_flag: u8,
    pub new_licensee_code: [u8; 2],
    pub sgb_flag: u8,
    pub cartridge_type: u8,
    pub rom_size: u8,
    pub ram_size: u8,
    pub destination_code: u8,
    pub old_licensee_code: u8,
    pub version: u8,
    pub header_checksum: u8,
    pub global_checksum: u16,
}

impl Header {
    fn parse(data: &[u8]) -> Self {
        let mut entry_point = [0u8; 4];
        entry_point.copy_from_slice(&data[0x0100..0x0104]);
        let mut logo = [0u8; 48];
        logo.copy_from_slice(&data[0x0104..0x0134]);

        let mut title = String::new();
        for &b in &data[0x0134..0x0144] {
            if b == 0 {
                break;
            }
            title.push(b as char);
        }

        let mut manufacturer_code = [0u8; 4];
        manufacturer_code.copy_from_slice(&data[0x013F..0x0143]);
        let mut new_licensee_code = [0u8; 2];
        new_licensee_code.copy_from_slice(&data[0x0144..0x0146]);

        Self {
            entry_point,
            logo,
            title,
            manufacturer_code,
            cgb_flag: data[0x0143],
            new_licensee_code,
            sgb_flag: data[0x0146],
            cartridge_type: data[0x0147],
            rom_size: data[0x0148],
            ram_size: data[0x0149],
            destination_code: data[0x014A],
            old_licensee_code: data[0x014B],
            version: data[0x014C],
            header_checksum: data[0x014D],
            global_checksum: ((data[0x014E] as u16) << 8) | data[0x014F] as u16,
        }
    }

    /// 0x80 (dual) or 0xC0 (CGB only) both enable color mode.
    pub fn cgb_supported(&self) -> bool {
        self.cgb_flag & 0x80 != 0
    }

    pub fn mbc_type(&self) -> MbcType {
        match self.cartridge_type {
            0x01..=0x03 => MbcType::Mbc1,
            0x0F..=0x13 => MbcType::Mbc3,
            0x19..=0x1E => MbcType::Mbc5,
            // 0x00, and anything unrecognized, behaves as a plain 32 KiB ROM.
            _ => MbcType::NoMbc,
        }
    }

    pub fn has_battery(&self) -> bool {
        matches!(
            self.cartridge_type,
            0x03 | 0x06 | 0x09 | 0x0D | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E
        )
    }

    pub fn has_rtc(&self) -> bool {
        matches!(self.cartridge_type, 0x0F | 0x10)
    }

    pub fn ram_size_bytes(&self) -> usize {
        match self.ram_size {
            0x00 => 0,
            0x01 => 0x800,
            0x02 => 0x2000,
            0x03 => 0x8000,
            0x04 => 0x20000,
            0x05 => 0x10000,
            _ => 0,
        }
    }
}

/// MBC3 real-time clock registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days_low: u8,
    /// Bit 0 = day counter MSB, bit 6 = halt, bit 7 = day carry.
    days_high: u8,
}

#[derive(Debug, Clone)]
struct Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    /// Wall-clock seconds since the epoch at the last register sync.
    base_timestamp: i64,
}

impl Rtc {
    fn new(now: i64) -> Self {
        Self {
            regs: RtcRegisters::default(),
            latched: RtcRegisters::default(),
            base_timestamp: now,
        }
    }

    /// Carry the elapsed wall-clock seconds into the live registers.
    fn sync_at(&mut self, now: i64) {
        // The halt bit suspends advance entirely.
        if self.regs.days_high & 0x40 != 0 {
            return;
        }

        let elapsed = now - self.base_timestamp;
        if elapsed <= 0 {
            return;
        }
        self.base_timestamp = now;

        let days = (((self.regs.days_high & 0x01) as i64) << 8) | self.regs.days_low as i64;
        let mut total = days * 86_400
            + self.regs.hours as i64 * 3_600
            + self.regs.minutes as i64 * 60
            + self.regs.seconds as i64
            + elapsed;

        self.regs.seconds = (total % 60) as u8;
        total /= 60;
        self.regs.minutes = (total % 60) as u8;
        total /= 60;
        self.regs.hours = (total % 24) as u8;
        total /= 24;

        // The day counter carry sticks once set.
        if total > 511 {
            self.regs.days_high |= 0x80;
        }
        let days = (total & 0x1FF) as u16;
        self.regs.days_low = days as u8;
        self.regs.days_high = (self.regs.days_high & 0xC0) | ((days >> 8) as u8 & 0x01);
    }

    fn latch(&mut self, now: i64) {
        self.sync_at(now);
        self.latched = self.regs;
    }

    fn read_latched(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds,
            0x09 => self.latched.minutes,
            0x0A => self.latched.hours,
            0x0B => self.latched.days_low,
            0x0C => self.latched.days_high,
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, reg: u8, val: u8, now: i64) {
        // Sync first so elapsed time up to this write is not lost.
        self.sync_at(now);
        match reg {
            0x08 => self.regs.seconds = val & 0x3F,
            0x09 => self.regs.minutes = val & 0x3F,
            0x0A => self.regs.hours = val & 0x1F,
            0x0B => self.regs.days_low = val,
            0x0C => self.regs.days_high = val & 0xC1,
            _ => {}
        }
        self.base_timestamp = now;
    }
}

#[derive(Debug)]
enum MbcState {
    NoMbc,
    Mbc1 {
        rom_bank: u8,
        ram_bank: u8,
        mode: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        /// 0x00-0x03 select RAM, 0x08-0x0C select an RTC register.
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
        latch_prev: u8,
    },
    Mbc5 {
        /// 9-bit bank number; bank 0 is valid here.
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
}

pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub header: Header,
    pub mbc: MbcType,
    save_path: Option<PathBuf>,
    mbc_state: MbcState,
}

impl Cartridge {
    /// Build a cartridge from a raw ROM image.
    pub fn load(data: Vec<u8>) -> Result<Self, CartridgeError> {
        if data.len() < HEADER_END {
            return Err(CartridgeError::TooSmall(data.len()));
        }

        let header = Header::parse(&data);
        let mbc = header.mbc_type();
        let now = unix_now();

        let mbc_state = match mbc {
            MbcType::NoMbc => MbcState::NoMbc,
            MbcType::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank: 0,
                mode: 0,
                ram_enable: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: header.has_rtc().then(|| Rtc::new(now)),
                latch_prev: 0xFF,
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
        };

        let ram = vec![0; header.ram_size_bytes()];
        Ok(Self {
            rom: data,
            ram,
            header,
            mbc,
            save_path: None,
            mbc_state,
        })
    }

    /// Load a ROM file; battery RAM is restored from the sibling `.sav`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let path = path.as_ref();
        let data =
            fs::read(path).map_err(|e| CartridgeError::Io(path.to_path_buf(), e))?;
        let mut cart = Self::load(data)?;

        if cart.header.has_battery() {
            let mut save = path.to_path_buf();
            save.set_extension("sav");
            cart.save_path = Some(save);
            cart.load_save_ram();
        }

        info!(
            "loaded {} (mbc: {:?}, cgb: {}, rom: {} KiB, ram: {} KiB)",
            cart.header.title,
            cart.mbc,
            cart.header.cgb_supported(),
            cart.rom.len() / 1024,
            cart.ram.len() / 1024,
        );
        Ok(cart)
    }

    pub fn is_cgb(&self) -> bool {
        self.header.cgb_supported()
    }

    /// Compare the header logo region against the expected bitmap. Exposed
    /// for hosts; a mismatch does not refuse the ROM.
    pub fn validate_logo(&self) -> bool {
        self.header.logo == NINTENDO_LOGO
    }

    /// Recompute the 0x0134-0x014C checksum and compare with the header.
    pub fn validate_header_checksum(&self) -> bool {
        let mut checksum = 0u8;
        for addr in 0x0134..=0x014C {
            checksum = checksum.wrapping_sub(self.rom[addr]).wrapping_sub(1);
        }
        checksum == self.header.header_checksum
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF => self.read_rom(addr),
            0xA000..=0xBFFF => self.read_ram(addr),
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF => self.write_control(addr, val),
            0xA000..=0xBFFF => self.write_ram(addr, val),
            _ => {}
        }
    }

    fn read_rom(&self, addr: u16) -> u8 {
        match &self.mbc_state {
            MbcState::NoMbc => self.rom.get(addr as usize).copied().unwrap_or(0xFF),
            MbcState::Mbc1 {
                rom_bank,
                ram_bank,
                mode,
                ..
            } => {
                if addr < 0x4000 {
                    // Mode 1 routes the upper bank bits through the bank-0
                    // window as well, for ROMs larger than 1 MiB.
                    if *mode == 1 && self.rom.len() > 0x100000 {
                        let bank = (*ram_bank as usize & 0x03) << 5;
                        return self.rom_byte(bank, addr as usize);
                    }
                    self.rom.get(addr as usize).copied().unwrap_or(0xFF)
                } else {
                    let mut bank = *rom_bank as usize;
                    if self.rom.len() > 0x100000 {
                        bank |= (*ram_bank as usize & 0x03) << 5;
                    }
                    self.rom_byte(bank, addr as usize - 0x4000)
                }
            }
            MbcState::Mbc3 { rom_bank, .. } => {
                if addr < 0x4000 {
                    self.rom.get(addr as usize).copied().unwrap_or(0xFF)
                } else {
                    self.rom_byte(*rom_bank as usize, addr as usize - 0x4000)
                }
            }
            MbcState::Mbc5 { rom_bank, .. } => {
                if addr < 0x4000 {
                    self.rom.get(addr as usize).copied().unwrap_or(0xFF)
                } else {
                    self.rom_byte(*rom_bank as usize, addr as usize - 0x4000)
                }
            }
        }
    }

    fn rom_byte(&self, bank: usize, offset: usize) -> u8 {
        if self.rom.is_empty() {
            return 0xFF;
        }
        let full = (bank * ROM_BANK_SIZE + offset) % self.rom.len();
        self.rom[full]
    }

    fn write_control(&mut self, addr: u16, val: u8) {
        match &mut self.mbc_state {
            MbcState::NoMbc => {}
            MbcState::Mbc1 {
                rom_bank,
                ram_bank,
                mode,
                ram_enable,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => {
                    *rom_bank = val & 0x1F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
                0x4000..=0x5FFF => *ram_bank = val & 0x03,
                _ => *mode = val & 0x01,
            },
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                rtc,
                latch_prev,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => {
                    *rom_bank = val & 0x7F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
                0x4000..=0x5FFF => *ram_bank = val,
                _ => {
                    // A 0x00 followed by 0x01 snapshots the live clock.
                    if *latch_prev == 0x00 && val == 0x01 {
                        if let Some(rtc) = rtc.as_mut() {
                            rtc.latch(unix_now());
                        }
                    }
                    *latch_prev = val;
                }
            },
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x2FFF => *rom_bank = (*rom_bank & 0x100) | val as u16,
                0x3000..=0x3FFF => *rom_bank = (*rom_bank & 0x0FF) | (((val & 0x01) as u16) << 8),
                0x4000..=0x5FFF => *ram_bank = val & 0x0F,
                _ => {}
            },
        }
    }

    fn read_ram(&self, addr: u16) -> u8 {
        match &self.mbc_state {
            MbcState::NoMbc => self
                .ram
                .get(addr as usize - 0xA000)
                .copied()
                .unwrap_or(0xFF),
            MbcState::Mbc1 {
                ram_bank,
                mode,
                ram_enable,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                let bank = if *mode == 1 { *ram_bank & 0x03 } else { 0 };
                self.ram_byte(bank, addr)
            }
            MbcState::Mbc3 {
                ram_bank,
                ram_enable,
                rtc,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                match *ram_bank {
                    0x00..=0x03 => self.ram_byte(*ram_bank, addr),
                    0x08..=0x0C => rtc
                        .as_ref()
                        .map(|r| r.read_latched(*ram_bank))
                        .unwrap_or(0xFF),
                    _ => 0xFF,
                }
            }
            MbcState::Mbc5 {
                ram_bank,
                ram_enable,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                self.ram_byte(*ram_bank & 0x0F, addr)
            }
        }
    }

    fn ram_byte(&self, bank: u8, addr: u16) -> u8 {
        let offset = self.ram_offset(bank, addr);
        self.ram.get(offset).copied().unwrap_or(0xFF)
    }

    fn ram_offset(&self, bank: u8, addr: u16) -> usize {
        let base = addr as usize - 0xA000;
        if self.ram.len() > RAM_BANK_SIZE {
            bank as usize * RAM_BANK_SIZE + base
        } else {
            base
        }
    }

    fn write_ram(&mut self, addr: u16, val: u8) {
        let now = unix_now();
        match &mut self.mbc_state {
            MbcState::NoMbc => {
                let idx = addr as usize - 0xA000;
                if let Some(b) = self.ram.get_mut(idx) {
                    *b = val;
                }
            }
            MbcState::Mbc1 {
                ram_bank,
                mode,
                ram_enable,
                ..
            } => {
                if !*ram_enable {
                    return;
                }
                let bank = if *mode == 1 { *ram_bank & 0x03 } else { 0 };
                let base = addr as usize - 0xA000;
                let offset = if self.ram.len() > RAM_BANK_SIZE {
                    bank as usize * RAM_BANK_SIZE + base
                } else {
                    base
                };
                if let Some(b) = self.ram.get_mut(offset) {
                    *b = val;
                }
            }
            MbcState::Mbc3 {
                ram_bank,
                ram_enable,
                rtc,
                ..
            } => {
                if !*ram_enable {
                    return;
                }
                match *ram_bank {
                    0x00..=0x03 => {
                        let base = addr as usize - 0xA000;
                        let offset = if self.ram.len() > RAM_BANK_SIZE {
                            (*ram_bank & 0x03) as usize * RAM_BANK_SIZE + base
                        } else {
                            base
                        };
                        if let Some(b) = self.ram.get_mut(offset) {
                            *b = val;
                        }
                    }
                    0x08..=0x0C => {
                        if let Some(rtc) = rtc.as_mut() {
                            rtc.write_register(*ram_bank, val, now);
                        }
                    }
                    _ => {}
                }
            }
            MbcState::Mbc5 {
                ram_bank,
                ram_enable,
                ..
            } => {
                if !*ram_enable {
                    return;
                }
                let base = addr as usize - 0xA000;
                let offset = if self.ram.len() > RAM_BANK_SIZE {
                    (*ram_bank & 0x0F) as usize * RAM_BANK_SIZE + base
                } else {
                    base
                };
                if let Some(b) = self.ram.get_mut(offset) {
                    *b = val;
                }
            }
        }
    }

    fn rtc(&self) -> Option<&Rtc> {
        match &self.mbc_state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => Some(rtc),
            _ => None,
        }
    }

    fn rtc_mut(&mut self) -> Option<&mut Rtc> {
        match &mut self.mbc_state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => Some(rtc),
            _ => None,
        }
    }

    /// Persist battery RAM (and the RTC appendix) to the `.sav` path.
    pub fn save_ram(&mut self) -> io::Result<()> {
        if !self.header.has_battery() {
            return Ok(());
        }
        let path = match &self.save_path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };

        let now = unix_now();
        if let Some(rtc) = self.rtc_mut() {
            rtc.sync_at(now);
        }

        let mut out = Vec::with_capacity(self.ram.len() + 48);
        out.extend_from_slice(&self.ram);
        if let Some(rtc) = self.rtc() {
            // 5x4 bytes current, 5x4 bytes latched, 8-byte timestamp.
            for reg in [
                rtc.regs.seconds,
                rtc.regs.minutes,
                rtc.regs.hours,
                rtc.regs.days_low,
                rtc.regs.days_high,
                rtc.latched.seconds,
                rtc.latched.minutes,
                rtc.latched.hours,
                rtc.latched.days_low,
                rtc.latched.days_high,
            ] {
                out.extend_from_slice(&(reg as u32).to_le_bytes());
            }
            out.extend_from_slice(&now.to_le_bytes());
        }

        fs::write(&path, &out)
    }

    fn load_save_ram(&mut self) {
        let path = match &self.save_path {
            Some(p) => p.clone(),
            None => return,
        };
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(_) => return,
        };

        let ram_len = self.ram.len();
        let expected_with_rtc = ram_len + 48;
        if bytes.len() != ram_len && bytes.len() != expected_with_rtc {
            warn!(
                "ignoring {}: unexpected size {} (want {} or {})",
                path.display(),
                bytes.len(),
                ram_len,
                expected_with_rtc
            );
            return;
        }

        self.ram.copy_from_slice(&bytes[..ram_len]);

        if bytes.len() == expected_with_rtc {
            let tail = &bytes[ram_len..];
            let reg = |i: usize| -> u8 {
                u32::from_le_bytes([tail[i * 4], tail[i * 4 + 1], tail[i * 4 + 2], tail[i * 4 + 3]])
                    as u8
            };
            let mut ts = [0u8; 8];
            ts.copy_from_slice(&tail[40..48]);
            let stamp = i64::from_le_bytes(ts);

            if let Some(rtc) = self.rtc_mut() {
                rtc.regs = RtcRegisters {
                    seconds: reg(0),
                    minutes: reg(1),
                    hours: reg(2),
                    days_low: reg(3),
                    days_high: reg(4),
                };
                rtc.latched = RtcRegisters {
                    seconds: reg(5),
                    minutes: reg(6),
                    hours: reg(7),
                    days_low: reg(8),
                    days_high: reg(9),
                };
                rtc.base_timestamp = stamp;
                rtc.sync_at(unix_now());
            }
        }
    }

    pub fn save_state(&self, out: &mut dyn Write) -> io::Result<()> {
        let (rom_bank, ram_bank, ram_enable, mode) = match &self.mbc_state {
            MbcState::NoMbc => (0u16, 0u8, false, 0u8),
            MbcState::Mbc1 {
                rom_bank,
                ram_bank,
                mode,
                ram_enable,
            } => (*rom_bank as u16, *ram_bank, *ram_enable, *mode),
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                ..
            } => (*rom_bank as u16, *ram_bank, *ram_enable, 0),
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => (*rom_bank, *ram_bank, *ram_enable, 0),
        };

        state::write_u16(out, rom_bank)?;
        state::write_u8(out, ram_bank)?;
        state::write_bool(out, ram_enable)?;
        state::write_u8(out, mode)?;
        state::write_vec(out, &self.ram)?;

        if let MbcState::Mbc3 {
            rtc, latch_prev, ..
        } = &self.mbc_state
        {
            state::write_u8(out, *latch_prev)?;
            if let Some(rtc) = rtc {
                for reg in [
                    rtc.regs.seconds,
                    rtc.regs.minutes,
                    rtc.regs.hours,
                    rtc.regs.days_low,
                    rtc.regs.days_high,
                    rtc.latched.seconds,
                    rtc.latched.minutes,
                    rtc.latched.hours,
                    rtc.latched.days_low,
                    rtc.latched.days_high,
                ] {
                    state::write_u8(out, reg)?;
                }
                state::write_i64(out, rtc.base_timestamp)?;
            }
        }
        Ok(())
    }

    pub fn load_state(&mut self, input: &mut dyn Read) -> io::Result<()> {
        let rom_bank = state::read_u16(input)?;
        let ram_bank = state::read_u8(input)?;
        let ram_enable = state::read_bool(input)?;
        let mode = state::read_u8(input)?;
        let ram = state::read_vec(input)?;
        if ram.len() == self.ram.len() {
            self.ram = ram;
        }

        match &mut self.mbc_state {
            MbcState::NoMbc => {}
            MbcState::Mbc1 {
                rom_bank: rb,
                ram_bank: sb,
                mode: m,
                ram_enable: en,
            } => {
                *rb = rom_bank as u8;
                *sb = ram_bank;
                *m = mode;
                *en = ram_enable;
            }
            MbcState::Mbc3 {
                rom_bank: rb,
                ram_bank: sb,
                ram_enable: en,
                rtc,
                latch_prev,
            } => {
                *rb = rom_bank as u8;
                *sb = ram_bank;
                *en = ram_enable;
                *latch_prev = state::read_u8(input)?;
                if let Some(rtc) = rtc.as_mut() {
                    let mut regs = [0u8; 10];
                    state::read_bytes(input, &mut regs)?;
                    rtc.regs = RtcRegisters {
                        seconds: regs[0],
                        minutes: regs[1],
                        hours: regs[2],
                        days_low: regs[3],
                        days_high: regs[4],
                    };
                    rtc.latched = RtcRegisters {
                        seconds: regs[5],
                        minutes: regs[6],
                        hours: regs[7],
                        days_low: regs[8],
                        days_high: regs[9],
                    };
                    rtc.base_timestamp = state::read_i64(input)?;
                }
            }
            MbcState::Mbc5 {
                rom_bank: rb,
                ram_bank: sb,
                ram_enable: en,
            } => {
                *rb = rom_bank;
                *sb = ram_bank;
                *en = ram_enable;
            }
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with_type(cart_type: u8, ram_size: u8, banks: usize) -> Vec<u8> {
        let mut rom = vec![0u8; banks * ROM_BANK_SIZE];
        rom[0x0147] = cart_type;
        rom[0x0149] = ram_size;
        // Tag every bank so reads identify which one is mapped.
        for bank in 0..banks {
            rom[bank * ROM_BANK_SIZE] = bank as u8;
            rom[bank * ROM_BANK_SIZE + 1] = (bank >> 8) as u8;
        }
        rom
    }

    #[test]
    fn rejects_undersized_image() {
        assert!(matches!(
            Cartridge::load(vec![0; 0x100]),
            Err(CartridgeError::TooSmall(0x100))
        ));
    }

    #[test]
    fn unknown_type_falls_back_to_no_mbc() {
        let mut rom = rom_with_type(0xFC, 0, 2);
        rom[0x0147] = 0xFC; // Pocket Camera, unsupported here
        let cart = Cartridge::load(rom).unwrap();
        assert_eq!(cart.mbc, MbcType::NoMbc);
        assert_eq!(cart.read(0x4000), 1);
    }

    #[test]
    fn header_fields_parse() {
        let mut rom = rom_with_type(0x13, 0x03, 2);
        rom[0x0134..0x0139].copy_from_slice(b"ZELDA");
        rom[0x0143] = 0x80;
        let cart = Cartridge::load(rom).unwrap();
        assert_eq!(cart.header.title, "ZELDA");
        assert!(cart.is_cgb());
        assert_eq!(cart.mbc, MbcType::Mbc3);
        assert!(cart.header.has_battery());
        assert!(!cart.header.has_rtc());
        assert_eq!(cart.ram.len(), 0x8000);
    }

    #[test]
    fn header_checksum_validation() {
        let mut rom = rom_with_type(0x00, 0, 2);
        let mut checksum = 0u8;
        for addr in 0x0134..=0x014C {
            checksum = checksum.wrapping_sub(rom[addr]).wrapping_sub(1);
        }
        rom[0x014D] = checksum;
        let cart = Cartridge::load(rom).unwrap();
        assert!(cart.validate_header_checksum());
        assert!(!cart.validate_logo());
    }

    #[test]
    fn mbc1_rom_bank_zero_coerces_to_one() {
        let rom = rom_with_type(0x01, 0, 4);
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0x2000, 0x00);
        assert_eq!(cart.read(0x4000), 1);
        cart.write(0x2000, 0x02);
        assert_eq!(cart.read(0x4000), 2);
    }

    #[test]
    fn mbc1_mode1_remaps_bank_zero_window() {
        // 2 MiB ROM: mode-1 upper bits apply to the 0x0000-0x3FFF window.
        let rom = rom_with_type(0x01, 0x03, 128);
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0x4000, 0x03); // bank-high = 3
        cart.write(0x6000, 0x01); // mode 1
        // Bank 3 << 5 = 0x60, so ROM offset 0x60 * 0x4000 = 0x180000.
        assert_eq!(cart.read(0x0000), 0x60);
        cart.write(0x6000, 0x00);
        assert_eq!(cart.read(0x0000), 0x00);
    }

    #[test]
    fn mbc1_ram_requires_enable() {
        let rom = rom_with_type(0x03, 0x03, 4);
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0xA000, 0x55);
        assert_eq!(cart.read(0xA000), 0xFF);
        cart.write(0x0000, 0x0A);
        cart.write(0xA000, 0x55);
        assert_eq!(cart.read(0xA000), 0x55);
        cart.write(0x0000, 0x00);
        assert_eq!(cart.read(0xA000), 0xFF);
    }

    #[test]
    fn mbc5_bank_zero_is_valid() {
        let rom = rom_with_type(0x19, 0, 4);
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0x2000, 0x00);
        assert_eq!(cart.read(0x4000), 0);
        cart.write(0x2000, 0x03);
        assert_eq!(cart.read(0x4000), 3);
    }

    #[test]
    fn mbc5_nine_bit_bank() {
        let rom = rom_with_type(0x19, 0, 512);
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0x2000, 0x04);
        cart.write(0x3000, 0x01);
        assert_eq!(cart.read(0x4000), 0x04);
        assert_eq!(cart.read(0x4001), 0x01); // bank 0x104
    }

    #[test]
    fn mbc3_rtc_latch_requires_zero_then_one() {
        let rom = rom_with_type(0x0F, 0x03, 4);
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0x0000, 0x0A);

        // Make an hour pass, then latch.
        if let Some(rtc) = cart.rtc_mut() {
            rtc.base_timestamp -= 3_600;
        }
        cart.write(0x6000, 0x00);
        cart.write(0x6000, 0x01);

        cart.write(0x4000, 0x0A); // select RTC hours
        assert_eq!(cart.read(0xA000), 1);
        cart.write(0x4000, 0x08); // seconds
        assert_eq!(cart.read(0xA000), 0);
    }

    #[test]
    fn mbc3_rtc_halt_freezes_clock() {
        let rom = rom_with_type(0x0F, 0, 4);
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0x4000, 0x0C);
        cart.write(0xA000, 0x40); // halt

        if let Some(rtc) = cart.rtc_mut() {
            rtc.base_timestamp -= 1_000;
            rtc.sync_at(unix_now());
            assert_eq!(rtc.regs.seconds, 0);
        }
    }

    #[test]
    fn mbc3_rtc_day_carry_sticks() {
        let rom = rom_with_type(0x0F, 0, 4);
        let mut cart = Cartridge::load(rom).unwrap();
        let now = unix_now();
        let rtc = cart.rtc_mut().unwrap();
        rtc.regs.days_low = 0xFF;
        rtc.regs.days_high = 0x01; // day 511
        rtc.base_timestamp = now - 86_400;
        rtc.sync_at(now);
        assert_eq!(rtc.regs.days_high & 0x80, 0x80);
        assert_eq!(
            ((rtc.regs.days_high & 0x01) as u16) << 8 | rtc.regs.days_low as u16,
            0
        );
    }

    #[test]
    fn battery_file_round_trips_ram_and_rtc() {
        let dir = tempfile::tempdir().unwrap();
        let rom_path = dir.path().join("game.gb");
        let rom = rom_with_type(0x10, 0x03, 4);
        fs::write(&rom_path, &rom).unwrap();

        let mut cart = Cartridge::from_file(&rom_path).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0x4000, 0x00);
        cart.write(0xA123, 0x42);
        cart.save_ram().unwrap();

        let sav = fs::read(dir.path().join("game.sav")).unwrap();
        assert_eq!(sav.len(), 0x8000 + 48);

        let cart2 = Cartridge::from_file(&rom_path).unwrap();
        assert_eq!(cart2.ram[0x123], 0x42);
    }

    #[test]
    fn state_round_trip_restores_banks() {
        let rom = rom_with_type(0x1B, 0x03, 64);
        let mut cart = Cartridge::load(rom.clone()).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0x2000, 0x21);
        cart.write(0x4000, 0x02);
        cart.write(0xA000, 0x99);

        let mut buf = Vec::new();
        cart.save_state(&mut buf).unwrap();

        let mut restored = Cartridge::load(rom).unwrap();
        restored.load_state(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.read(0x4000), 0x21);
        assert_eq!(restored.read(0xA000), 0x99);
    }
}
