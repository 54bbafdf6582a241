//! Simulated peripherals for host side use and testing.
//!
//! [`SimSerial`] is a pair of byte queues standing in for the UART,
//! [`SimFlash`] models the on-chip flash controller and [`SimNor`] interprets
//! the W25Q instruction set behind an SPI bus and chip select.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::spi;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial;

use crate::flash::{FlashUnit, APP_END, ERASE_BLOCK_SIZE, WORD_SIZE};
use crate::nor::{self, Instruction};

#[derive(Default)]
struct SerialQueues {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

/// Serial port backed by shared in-memory queues.
///
/// Clones share the same queues, so a test can keep a handle while the
/// bootloader owns another.
#[derive(Clone, Default)]
pub struct SimSerial {
    inner: Rc<RefCell<SerialQueues>>,
}

impl SimSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the device to receive
    pub fn push(&self, data: &[u8]) {
        self.inner.borrow_mut().input.extend(data.iter().copied());
    }

    /// Take everything the device has transmitted so far
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.borrow_mut().output)
    }

    /// Bytes queued but not yet received
    pub fn pending(&self) -> usize {
        self.inner.borrow().input.len()
    }
}

impl serial::Read<u8> for SimSerial {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.inner
            .borrow_mut()
            .input
            .pop_front()
            .ok_or(nb::Error::WouldBlock)
    }
}

impl serial::Write<u8> for SimSerial {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.inner.borrow_mut().output.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum SimFlashError {
    #[error("address 0x{0:08x} out of range")]
    OutOfRange(u32),

    #[error("injected fault at 0x{0:08x}")]
    Injected(u32),

    #[error("flash controller locked")]
    Locked,
}

/// Internal flash model.
///
/// Programming can only clear bits, erasing sets a whole erase block back to
/// 0xFF. Programs and erases fail unless updates are enabled.
pub struct SimFlash {
    mem: Vec<u8>,
    unlocked: bool,
    erases: u32,
    fail_program: Option<u32>,
    fail_read: Option<u32>,
    fail_erase: Option<u32>,
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            mem: vec![0xFF; APP_END as usize + 1],
            unlocked: false,
            erases: 0,
            fail_program: None,
            fail_read: None,
            fail_erase: None,
        }
    }

    /// Overwrite memory directly, bypassing the controller
    pub fn load(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    pub fn slice(&self, address: u32, len: usize) -> &[u8] {
        let start = address as usize;
        &self.mem[start..start + len]
    }

    /// Successful block erases so far
    pub fn erase_count(&self) -> u32 {
        self.erases
    }

    pub fn update_enabled(&self) -> bool {
        self.unlocked
    }

    pub fn fail_program_at(&mut self, address: Option<u32>) {
        self.fail_program = address;
    }

    pub fn fail_read_at(&mut self, address: Option<u32>) {
        self.fail_read = address;
    }

    pub fn fail_erase_at(&mut self, address: Option<u32>) {
        self.fail_erase = address;
    }

    fn word_range(&self, address: u32) -> Result<std::ops::Range<usize>, SimFlashError> {
        let start = address as usize;
        if address % WORD_SIZE != 0 || start + WORD_SIZE as usize > self.mem.len() {
            return Err(SimFlashError::OutOfRange(address));
        }
        Ok(start..start + WORD_SIZE as usize)
    }
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashUnit for SimFlash {
    type Error = SimFlashError;

    fn program_word(&mut self, address: u32, word: u32) -> Result<(), Self::Error> {
        if !self.unlocked {
            return Err(SimFlashError::Locked);
        }
        if self.fail_program == Some(address) {
            return Err(SimFlashError::Injected(address));
        }

        let range = self.word_range(address)?;
        for (m, b) in self.mem[range].iter_mut().zip(word.to_le_bytes().iter()) {
            *m &= *b;
        }

        Ok(())
    }

    fn read_word(&mut self, address: u32) -> Result<u32, Self::Error> {
        if self.fail_read == Some(address) {
            return Err(SimFlashError::Injected(address));
        }

        let range = self.word_range(address)?;
        let w = &self.mem[range];
        Ok(u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    }

    fn erase_block(&mut self, address: u32) -> Result<(), Self::Error> {
        if !self.unlocked {
            return Err(SimFlashError::Locked);
        }
        if self.fail_erase == Some(address) {
            return Err(SimFlashError::Injected(address));
        }

        let start = (address - address % ERASE_BLOCK_SIZE) as usize;
        let end = start + ERASE_BLOCK_SIZE as usize;
        if end > self.mem.len() {
            return Err(SimFlashError::OutOfRange(address));
        }

        for b in &mut self.mem[start..end] {
            *b = 0xFF;
        }
        self.erases += 1;

        Ok(())
    }

    fn enable_update(&mut self) {
        self.unlocked = true;
    }

    fn disable_update(&mut self) {
        self.unlocked = false;
    }
}

/// Unique ID reported by the simulated NOR chip
pub const SIM_UNIQUE_ID: [u8; 8] = [0xD1, 0x63, 0x38, 0x13, 0x27, 0x4A, 0x31, 0x2E];

/// JEDEC ID of a W25Q128JV
const SIM_JEDEC_ID: [u8; 3] = [0xEF, 0x40, 0x18];

/// Status reads a program or erase stays busy for by default
const DEFAULT_BUSY_CYCLES: u32 = 2;

struct NorCore {
    mem: Vec<u8>,
    selected: bool,
    /// Busy when the current transaction started
    busy_at_select: bool,
    /// Bytes clocked in during the current transaction
    cmd: Vec<u8>,
    wel: bool,
    busy: u32,
    busy_cycles: u32,
    ignored: u32,
}

impl NorCore {
    fn status(&self) -> u8 {
        let mut s = 0;
        if self.busy > 0 {
            s |= nor::STATUS_BUSY;
        }
        if self.wel {
            s |= nor::STATUS_WEL;
        }
        s
    }

    /// Clock one byte in, returning the byte clocked out
    fn clock(&mut self, b: u8) -> u8 {
        if !self.selected {
            return 0xFF;
        }

        let pos = self.cmd.len();
        self.cmd.push(b);

        if pos == 0 {
            return 0xFF;
        }

        match Instruction::from_u8(self.cmd[0]) {
            Some(Instruction::ReadStatus1) => {
                let s = self.status();
                self.busy = self.busy.saturating_sub(1);
                s
            }
            _ if self.busy_at_select => 0xFF,
            Some(Instruction::JedecId) => SIM_JEDEC_ID.get(pos - 1).copied().unwrap_or(0xFF),
            Some(Instruction::ReadUniqueId) if pos >= 5 => {
                SIM_UNIQUE_ID.get(pos - 5).copied().unwrap_or(0xFF)
            }
            Some(Instruction::FastRead) if pos >= 5 => {
                let address = self.address().unwrap_or(0) as usize + pos - 5;
                self.mem[address % self.mem.len()]
            }
            _ => 0xFF,
        }
    }

    fn address(&self) -> Option<u32> {
        let a = self.cmd.get(1..4)?;
        Some(u32::from_be_bytes([0, a[0], a[1], a[2]]))
    }

    fn select(&mut self) {
        self.selected = true;
        self.busy_at_select = self.busy > 0;
        self.cmd.clear();
    }

    /// Execute the transaction on the rising edge of chip select
    fn deselect(&mut self) {
        if !self.selected {
            return;
        }
        self.selected = false;

        let op = match self.cmd.first().and_then(|c| Instruction::from_u8(*c)) {
            Some(op) => op,
            None => return,
        };

        if op == Instruction::ReadStatus1 {
            return;
        }
        if self.busy_at_select {
            self.ignored += 1;
            return;
        }

        match op {
            Instruction::WriteEnable => self.wel = true,
            Instruction::WriteDisable => self.wel = false,
            Instruction::PageProgram
            | Instruction::SectorErase
            | Instruction::BlockErase
            | Instruction::ChipErase => self.modify(op),
            _ => (),
        }
    }

    fn modify(&mut self, op: Instruction) {
        if !self.wel {
            self.ignored += 1;
            return;
        }

        let size = self.mem.len() as u32;
        let address = match (op, self.address()) {
            (Instruction::ChipErase, _) => 0,
            (_, Some(a)) => a % size,
            (_, None) => {
                self.ignored += 1;
                return;
            }
        };

        match op {
            Instruction::PageProgram => {
                let page = address - address % nor::PAGE_SIZE;
                let mut offset = address % nor::PAGE_SIZE;
                for b in &self.cmd[4..] {
                    self.mem[(page + offset) as usize] &= *b;
                    offset = (offset + 1) % nor::PAGE_SIZE;
                }
            }
            Instruction::SectorErase => self.erase(address, nor::SECTOR_SIZE),
            Instruction::BlockErase => self.erase(address, nor::BLOCK_SIZE),
            _ => self.erase(0, size),
        }

        self.wel = false;
        self.busy = self.busy_cycles;
    }

    fn erase(&mut self, address: u32, len: u32) {
        let start = (address - address % len) as usize;
        for b in &mut self.mem[start..start + len as usize] {
            *b = nor::ERASED;
        }
    }
}

/// W25Q NOR flash model.
///
/// Commands are executed when chip select is released. Programs and erases
/// leave the chip busy for a number of status reads, instructions issued in
/// that window (or without a preceding write-enable) are dropped and counted.
#[derive(Clone)]
pub struct SimNor {
    core: Rc<RefCell<NorCore>>,
}

impl SimNor {
    /// A blank (erased) chip
    pub fn new() -> Self {
        Self {
            core: Rc::new(RefCell::new(NorCore {
                mem: vec![nor::ERASED; nor::FLASH_SIZE as usize],
                selected: false,
                busy_at_select: false,
                cmd: Vec::new(),
                wel: false,
                busy: 0,
                busy_cycles: DEFAULT_BUSY_CYCLES,
                ignored: 0,
            })),
        }
    }

    pub fn spi(&self) -> SimNorSpi {
        SimNorSpi {
            core: self.core.clone(),
        }
    }

    pub fn cs(&self) -> SimNorCs {
        SimNorCs {
            core: self.core.clone(),
        }
    }

    /// Overwrite memory directly, truncated at the end of the chip
    pub fn load(&self, address: u32, data: &[u8]) {
        let mut core = self.core.borrow_mut();
        let start = (address as usize).min(core.mem.len());
        let end = (start + data.len()).min(core.mem.len());
        core.mem[start..end].copy_from_slice(&data[..end - start]);
    }

    pub fn snapshot(&self, address: u32, len: usize) -> Vec<u8> {
        let core = self.core.borrow();
        let start = address as usize;
        core.mem[start..start + len].to_vec()
    }

    /// Instructions dropped because the chip was busy or not write enabled
    pub fn ignored(&self) -> u32 {
        self.core.borrow().ignored
    }

    pub fn set_busy_cycles(&self, cycles: u32) {
        self.core.borrow_mut().busy_cycles = cycles;
    }
}

impl Default for SimNor {
    fn default() -> Self {
        Self::new()
    }
}

/// SPI bus handle of a [`SimNor`]
pub struct SimNorSpi {
    core: Rc<RefCell<NorCore>>,
}

impl spi::Transfer<u8> for SimNorSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut core = self.core.borrow_mut();
        for w in words.iter_mut() {
            *w = core.clock(*w);
        }
        Ok(words)
    }
}

impl spi::Write<u8> for SimNorSpi {
    type Error = Infallible;

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut core = self.core.borrow_mut();
        for w in words {
            core.clock(*w);
        }
        Ok(())
    }
}

/// Chip select line of a [`SimNor`], active low
pub struct SimNorCs {
    core: Rc<RefCell<NorCore>>,
}

impl OutputPin for SimNorCs {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.core.borrow_mut().select();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.core.borrow_mut().deselect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::blocking::spi::{Transfer, Write};

    #[test]
    fn serial_queues_shared() {
        let a = SimSerial::new();
        let mut b = a.clone();

        a.push(&[1, 2]);
        assert_eq!(serial::Read::read(&mut b), Ok(1));
        assert_eq!(a.pending(), 1);

        serial::Write::write(&mut b, 9).unwrap();
        assert_eq!(a.take_output(), vec![9]);
        assert!(a.take_output().is_empty());

        assert_eq!(serial::Read::read(&mut b), Ok(2));
        assert_eq!(serial::Read::read(&mut b), Err(nb::Error::WouldBlock));
    }

    #[test]
    fn flash_bits_only_clear() {
        let mut f = SimFlash::new();
        f.enable_update();

        f.program_word(0x1_0000, 0x0F0F_FFFF).unwrap();
        f.program_word(0x1_0000, 0xFFFF_00FF).unwrap();
        assert_eq!(f.read_word(0x1_0000), Ok(0x0F0F_00FF));

        assert_eq!(
            f.program_word(0x1_0002, 0),
            Err(SimFlashError::OutOfRange(0x1_0002))
        );
        assert_eq!(
            f.read_word(APP_END + 1),
            Err(SimFlashError::OutOfRange(APP_END + 1))
        );

        f.disable_update();
        assert_eq!(f.erase_block(0x1_0000), Err(SimFlashError::Locked));
    }

    #[test]
    fn nor_busy_drops_commands() {
        let sim = SimNor::new();
        sim.set_busy_cycles(5);
        let (mut spi, mut cs) = (sim.spi(), sim.cs());

        let tx = |spi: &mut SimNorSpi, cs: &mut SimNorCs, bytes: &[u8]| {
            cs.set_low().unwrap();
            spi.write(bytes).unwrap();
            cs.set_high().unwrap();
        };

        tx(&mut spi, &mut cs, &[0x06]);
        tx(&mut spi, &mut cs, &[0x02, 0x00, 0x00, 0x10, 0x12]);
        // Still busy, dropped
        tx(&mut spi, &mut cs, &[0x06]);
        assert_eq!(sim.ignored(), 1);

        cs.set_low().unwrap();
        spi.write(&[0x05]).unwrap();
        let mut status = [0u8; 6];
        spi.transfer(&mut status).unwrap();
        cs.set_high().unwrap();

        assert_eq!(status, [1, 1, 1, 1, 1, 0]);
        assert_eq!(sim.snapshot(0x10, 2), vec![0x12, 0xFF]);
    }
}
