//! W25Q series SPI NOR flash driver.
//!
//! Memory is addressed in nested units, page (256 B), sector (16 pages,
//! 4 KiB) and block (16 sectors, 64 KiB). Programs and erases are each
//! bracketed by write-enable, busy-poll, the operation, busy-poll. The chip
//! drops any instruction issued while busy, so neither poll may be skipped.
//!
//! Based on the W25Q128JV datasheet, section 8.
//!
//! Indices and addresses past the end of the chip fail with
//! [`NorError::OutOfRange`] before anything is sent. [`W25q`] also implements
//! the `embedded-storage` NOR traits so storage layers can sit directly on it.

use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

pub const PAGE_SIZE: u32 = 256;
pub const SECTOR_SIZE: u32 = 4096;
pub const BLOCK_SIZE: u32 = 65536;
pub const FLASH_SIZE: u32 = 0x20_0000;

/// Value of every byte after an erase
pub const ERASED: u8 = 0xFF;

/// Status register 1 BUSY bit
pub const STATUS_BUSY: u8 = 0x01;
/// Status register 1 write enable latch
pub const STATUS_WEL: u8 = 0x02;

const DUMMY: u8 = 0x00;

/// Standard SPI instructions (datasheet 8.1.2, table 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    WriteEnable = 0x06,
    WriteDisable = 0x04,

    /// Read status register 1
    ReadStatus1 = 0x05,

    /// Manufacturer, memory type and capacity
    JedecId = 0x9F,
    /// 64 bit factory unique ID, after four dummy bytes
    ReadUniqueId = 0x4B,

    /// Read with one dummy byte after the address
    FastRead = 0x0B,

    /// Program up to 256 bytes within one page
    PageProgram = 0x02,

    /// Erase 4 KiB
    SectorErase = 0x20,
    /// Erase 64 KiB
    BlockErase = 0xD8,
    ChipErase = 0xC7,
}

impl Instruction {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Instruction::*;

        let i = match v {
            0x06 => WriteEnable,
            0x04 => WriteDisable,
            0x05 => ReadStatus1,
            0x9F => JedecId,
            0x4B => ReadUniqueId,
            0x0B => FastRead,
            0x02 => PageProgram,
            0x20 => SectorErase,
            0xD8 => BlockErase,
            0xC7 => ChipErase,
            _ => return None,
        };

        Some(i)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NorError<SpiError, PinError> {
    #[error("spi error: {0:?}")]
    Spi(SpiError),

    #[error("chip select error: {0:?}")]
    Pin(PinError),

    #[error("still busy after {0} status polls")]
    BusyTimeout(u32),

    #[error("access at 0x{0:08x} beyond end of flash")]
    OutOfRange(u32),

    #[error("address 0x{0:08x} not aligned to an erase unit")]
    NotAligned(u32),
}

impl<SE: core::fmt::Debug, PE: core::fmt::Debug> NorFlashError for NorError<SE, PE> {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            NorError::OutOfRange(_) => NorFlashErrorKind::OutOfBounds,
            NorError::NotAligned(_) => NorFlashErrorKind::NotAligned,
            _ => NorFlashErrorKind::Other,
        }
    }
}

/// JEDEC identification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JedecId {
    pub manufacturer: u8,
    pub memory_type: u8,
    pub capacity: u8,
}

impl JedecId {
    /// Packed as `(manufacturer << 16) | (type << 8) | capacity`
    pub fn raw(&self) -> u32 {
        u32::from_be_bytes([0, self.manufacturer, self.memory_type, self.capacity])
    }
}

// Conversions to larger units divide, conversions to smaller units saturate
// so that an index past the end of the chip never wraps onto a valid address.

const PAGES_PER_SECTOR: u32 = SECTOR_SIZE / PAGE_SIZE;
const PAGES_PER_BLOCK: u32 = BLOCK_SIZE / PAGE_SIZE;
const SECTORS_PER_BLOCK: u32 = BLOCK_SIZE / SECTOR_SIZE;

pub fn page_address(page: u32) -> u32 {
    page.saturating_mul(PAGE_SIZE)
}

pub fn sector_address(sector: u32) -> u32 {
    sector.saturating_mul(SECTOR_SIZE)
}

pub fn block_address(block: u32) -> u32 {
    block.saturating_mul(BLOCK_SIZE)
}

pub fn byte_to_page(address: u32) -> u32 {
    address / PAGE_SIZE
}

pub fn byte_to_sector(address: u32) -> u32 {
    address / SECTOR_SIZE
}

pub fn byte_to_block(address: u32) -> u32 {
    address / BLOCK_SIZE
}

pub fn page_to_sector(page: u32) -> u32 {
    page / PAGES_PER_SECTOR
}

pub fn page_to_block(page: u32) -> u32 {
    page / PAGES_PER_BLOCK
}

pub fn sector_to_block(sector: u32) -> u32 {
    sector / SECTORS_PER_BLOCK
}

pub fn sector_to_page(sector: u32) -> u32 {
    sector.saturating_mul(PAGES_PER_SECTOR)
}

pub fn block_to_sector(block: u32) -> u32 {
    block.saturating_mul(SECTORS_PER_BLOCK)
}

pub fn block_to_page(block: u32) -> u32 {
    block.saturating_mul(PAGES_PER_BLOCK)
}

/// Whether `len` bytes from `address` lie on the chip
pub fn in_range(address: u32, len: usize) -> bool {
    match (address as u64).checked_add(len as u64) {
        Some(end) => end <= FLASH_SIZE as u64,
        None => false,
    }
}

/// Byte count actually transferred by a page access at `offset`.
///
/// Zero, or a count running past the end of the page, means "up to the end
/// of the page".
pub fn clamp_to_page(offset: u32, bytes: u32) -> u32 {
    if offset >= PAGE_SIZE {
        return 0;
    }

    if bytes == 0 || bytes.saturating_add(offset) > PAGE_SIZE {
        PAGE_SIZE - offset
    } else {
        bytes
    }
}

/// Portion of a sector or block access that falls in a single page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub page: u32,
    /// Offset within the page
    pub offset: u32,
    /// Bytes within the page
    pub len: u32,
    /// Position in the caller's buffer
    pub start: usize,
}

/// Page by page decomposition of an access to a sector or block
#[derive(Debug, Clone)]
pub struct PageSpans {
    page: u32,
    offset: u32,
    remaining: i64,
    start: usize,
}

/// Split an access of `bytes` at `offset` within the unit of `unit_size`
/// bytes starting at `first_page`.
///
/// Zero or oversized counts cover the whole unit, accesses are cut at the
/// end of the unit and an offset beyond it yields nothing.
pub fn page_spans(first_page: u32, unit_size: u32, offset: u32, bytes: u32) -> PageSpans {
    let bytes = if bytes > unit_size || bytes == 0 {
        unit_size
    } else {
        bytes
    };

    let remaining = if offset >= unit_size {
        0
    } else if bytes + offset > unit_size {
        unit_size - offset
    } else {
        bytes
    };

    PageSpans {
        page: first_page + offset / PAGE_SIZE,
        offset: offset % PAGE_SIZE,
        remaining: remaining as i64,
        start: 0,
    }
}

impl Iterator for PageSpans {
    type Item = PageSpan;

    fn next(&mut self) -> Option<PageSpan> {
        if self.remaining <= 0 {
            return None;
        }

        let room = PAGE_SIZE - self.offset;
        let span = PageSpan {
            page: self.page,
            offset: self.offset,
            len: clamp_to_page(self.offset, self.remaining as u32),
            start: self.start,
        };

        self.page += 1;
        self.remaining -= room as i64;
        self.start += room as usize;
        self.offset = 0;

        Some(span)
    }
}

pub struct W25q<SPI, CS> {
    spi: SPI,
    cs: CS,
    poll_limit: Option<u32>,
}

impl<SPI, CS, SE, PE> W25q<SPI, CS>
where
    SPI: Transfer<u8, Error = SE> + Write<u8, Error = SE>,
    CS: OutputPin<Error = PE>,
    SE: core::fmt::Debug,
    PE: core::fmt::Debug,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self {
            spi,
            cs,
            poll_limit: None,
        }
    }

    /// Fail busy waits after `limit` status reads instead of spinning forever
    pub fn with_poll_limit(mut self, limit: Option<u32>) -> Self {
        self.poll_limit = limit;
        self
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// Read and log the chip identification
    pub fn init(&mut self) -> Result<JedecId, NorError<SE, PE>> {
        let id = self.jedec_id()?;
        let uid = self.unique_id()?;

        info!(
            "NOR flash manufacturer 0x{:02x}, device 0x{:02x}{:02x}, unique id {:02x?}",
            id.manufacturer, id.memory_type, id.capacity, uid
        );
        debug!(
            "NOR geometry: page {} B, sector {} B, block {} B, capacity {} B",
            PAGE_SIZE, SECTOR_SIZE, BLOCK_SIZE, FLASH_SIZE
        );

        Ok(id)
    }

    pub fn jedec_id(&mut self) -> Result<JedecId, NorError<SE, PE>> {
        let mut id = [DUMMY; 3];

        self.select()?;
        self.spi_write(&[Instruction::JedecId as u8])?;
        self.spi_transfer(&mut id)?;
        self.deselect()?;

        Ok(JedecId {
            manufacturer: id[0],
            memory_type: id[1],
            capacity: id[2],
        })
    }

    pub fn unique_id(&mut self) -> Result<[u8; 8], NorError<SE, PE>> {
        let mut uid = [DUMMY; 8];

        self.select()?;
        self.spi_write(&[Instruction::ReadUniqueId as u8, DUMMY, DUMMY, DUMMY, DUMMY])?;
        self.spi_transfer(&mut uid)?;
        self.deselect()?;

        Ok(uid)
    }

    pub fn write_enable(&mut self) -> Result<(), NorError<SE, PE>> {
        self.command(&[Instruction::WriteEnable as u8])
    }

    pub fn write_disable(&mut self) -> Result<(), NorError<SE, PE>> {
        self.command(&[Instruction::WriteDisable as u8])
    }

    /// Poll status register 1 until the busy bit clears
    pub fn wait_for_busy(&mut self) -> Result<(), NorError<SE, PE>> {
        self.select()?;
        self.spi_write(&[Instruction::ReadStatus1 as u8])?;

        let mut polls = 0;
        loop {
            let mut status = [DUMMY];
            self.spi_transfer(&mut status)?;

            if status[0] & STATUS_BUSY == 0 {
                break;
            }

            polls += 1;
            if let Some(limit) = self.poll_limit {
                if polls >= limit {
                    self.deselect()?;
                    error!("NOR flash busy after {} polls", polls);
                    return Err(NorError::BusyTimeout(polls));
                }
            }
        }

        self.deselect()
    }

    pub fn erase_chip(&mut self) -> Result<(), NorError<SE, PE>> {
        debug!("Erasing chip");
        self.modify(&[Instruction::ChipErase as u8], &[])
    }

    pub fn erase_sector(&mut self, sector: u32) -> Result<(), NorError<SE, PE>> {
        let address = sector_address(sector);
        Self::check_range(address, SECTOR_SIZE as usize)?;

        let a = address_bytes(address);
        self.modify(&[Instruction::SectorErase as u8, a[0], a[1], a[2]], &[])
    }

    pub fn erase_block(&mut self, block: u32) -> Result<(), NorError<SE, PE>> {
        let address = block_address(block);
        Self::check_range(address, BLOCK_SIZE as usize)?;

        let a = address_bytes(address);
        self.modify(&[Instruction::BlockErase as u8, a[0], a[1], a[2]], &[])
    }

    pub fn write_byte(&mut self, value: u8, address: u32) -> Result<(), NorError<SE, PE>> {
        Self::check_range(address, 1)?;

        let a = address_bytes(address);
        self.modify(&[Instruction::PageProgram as u8, a[0], a[1], a[2]], &[value])
    }

    /// Program up to one page.
    ///
    /// `bytes` is clamped to the end of the page (0 means the rest of the
    /// page) and to the length of `buf`. The page must already be erased.
    pub fn write_page(
        &mut self,
        buf: &[u8],
        page: u32,
        offset: u32,
        bytes: u32,
    ) -> Result<(), NorError<SE, PE>> {
        let n = (clamp_to_page(offset, bytes) as usize).min(buf.len());
        if n == 0 {
            return Ok(());
        }

        let address = page_address(page).saturating_add(offset);
        Self::check_range(address, n)?;

        let a = address_bytes(address);
        self.modify(&[Instruction::PageProgram as u8, a[0], a[1], a[2]], &buf[..n])
    }

    pub fn write_sector(
        &mut self,
        buf: &[u8],
        sector: u32,
        offset: u32,
        bytes: u32,
    ) -> Result<(), NorError<SE, PE>> {
        Self::check_range(sector_address(sector), SECTOR_SIZE as usize)?;

        for s in page_spans(sector_to_page(sector), SECTOR_SIZE, offset, bytes) {
            match buf.get(s.start..) {
                Some(b) if !b.is_empty() => self.write_page(b, s.page, s.offset, s.len)?,
                _ => break,
            }
        }
        Ok(())
    }

    pub fn write_block(
        &mut self,
        buf: &[u8],
        block: u32,
        offset: u32,
        bytes: u32,
    ) -> Result<(), NorError<SE, PE>> {
        Self::check_range(block_address(block), BLOCK_SIZE as usize)?;

        for s in page_spans(block_to_page(block), BLOCK_SIZE, offset, bytes) {
            match buf.get(s.start..) {
                Some(b) if !b.is_empty() => self.write_page(b, s.page, s.offset, s.len)?,
                _ => break,
            }
        }
        Ok(())
    }

    pub fn read_byte(&mut self, address: u32) -> Result<u8, NorError<SE, PE>> {
        let mut b = [0u8];
        self.read_bytes(&mut b, address)?;
        Ok(b[0])
    }

    /// Read `buf.len()` bytes from `address`, across page boundaries
    pub fn read_bytes(&mut self, buf: &mut [u8], address: u32) -> Result<(), NorError<SE, PE>> {
        Self::check_range(address, buf.len())?;

        let a = address_bytes(address);

        self.select()?;
        self.spi_write(&[Instruction::FastRead as u8, a[0], a[1], a[2], DUMMY])?;
        for b in buf.iter_mut() {
            *b = DUMMY;
        }
        self.spi_transfer(buf)?;
        self.deselect()
    }

    /// Read up to one page, with the same clamping as [`W25q::write_page`]
    pub fn read_page(
        &mut self,
        buf: &mut [u8],
        page: u32,
        offset: u32,
        bytes: u32,
    ) -> Result<(), NorError<SE, PE>> {
        let n = (clamp_to_page(offset, bytes) as usize).min(buf.len());
        if n == 0 {
            return Ok(());
        }

        self.read_bytes(&mut buf[..n], page_address(page).saturating_add(offset))
    }

    pub fn read_sector(
        &mut self,
        buf: &mut [u8],
        sector: u32,
        offset: u32,
        bytes: u32,
    ) -> Result<(), NorError<SE, PE>> {
        Self::check_range(sector_address(sector), SECTOR_SIZE as usize)?;

        for s in page_spans(sector_to_page(sector), SECTOR_SIZE, offset, bytes) {
            match buf.get_mut(s.start..) {
                Some(b) if !b.is_empty() => self.read_page(b, s.page, s.offset, s.len)?,
                _ => break,
            }
        }
        Ok(())
    }

    pub fn read_block(
        &mut self,
        buf: &mut [u8],
        block: u32,
        offset: u32,
        bytes: u32,
    ) -> Result<(), NorError<SE, PE>> {
        Self::check_range(block_address(block), BLOCK_SIZE as usize)?;

        for s in page_spans(block_to_page(block), BLOCK_SIZE, offset, bytes) {
            match buf.get_mut(s.start..) {
                Some(b) if !b.is_empty() => self.read_page(b, s.page, s.offset, s.len)?,
                _ => break,
            }
        }
        Ok(())
    }

    fn check_range(address: u32, len: usize) -> Result<(), NorError<SE, PE>> {
        if in_range(address, len) {
            Ok(())
        } else {
            Err(NorError::OutOfRange(address))
        }
    }

    /// Write-enable, wait, `header` + `data` in one transaction, wait
    fn modify(&mut self, header: &[u8], data: &[u8]) -> Result<(), NorError<SE, PE>> {
        self.write_enable()?;
        self.wait_for_busy()?;

        self.select()?;
        self.spi_write(header)?;
        if !data.is_empty() {
            self.spi_write(data)?;
        }
        self.deselect()?;

        self.wait_for_busy()
    }

    fn command(&mut self, bytes: &[u8]) -> Result<(), NorError<SE, PE>> {
        self.select()?;
        self.spi_write(bytes)?;
        self.deselect()
    }

    fn select(&mut self) -> Result<(), NorError<SE, PE>> {
        self.cs.set_low().map_err(NorError::Pin)
    }

    fn deselect(&mut self) -> Result<(), NorError<SE, PE>> {
        self.cs.set_high().map_err(NorError::Pin)
    }

    fn spi_write(&mut self, bytes: &[u8]) -> Result<(), NorError<SE, PE>> {
        self.spi.write(bytes).map_err(NorError::Spi)
    }

    fn spi_transfer(&mut self, words: &mut [u8]) -> Result<(), NorError<SE, PE>> {
        self.spi.transfer(words).map(|_| ()).map_err(NorError::Spi)
    }
}

impl<SPI, CS, SE, PE> ErrorType for W25q<SPI, CS>
where
    SPI: Transfer<u8, Error = SE> + Write<u8, Error = SE>,
    CS: OutputPin<Error = PE>,
    SE: core::fmt::Debug,
    PE: core::fmt::Debug,
{
    type Error = NorError<SE, PE>;
}

impl<SPI, CS, SE, PE> ReadNorFlash for W25q<SPI, CS>
where
    SPI: Transfer<u8, Error = SE> + Write<u8, Error = SE>,
    CS: OutputPin<Error = PE>,
    SE: core::fmt::Debug,
    PE: core::fmt::Debug,
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.read_bytes(bytes, offset)
    }

    fn capacity(&self) -> usize {
        FLASH_SIZE as usize
    }
}

impl<SPI, CS, SE, PE> NorFlash for W25q<SPI, CS>
where
    SPI: Transfer<u8, Error = SE> + Write<u8, Error = SE>,
    CS: OutputPin<Error = PE>,
    SE: core::fmt::Debug,
    PE: core::fmt::Debug,
{
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR_SIZE as usize;

    /// Erase the sectors covering `from..to`, both sector aligned
    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % SECTOR_SIZE != 0 || from > to {
            return Err(NorError::NotAligned(from));
        }
        if to % SECTOR_SIZE != 0 {
            return Err(NorError::NotAligned(to));
        }
        Self::check_range(from, (to - from) as usize)?;

        for sector in byte_to_sector(from)..byte_to_sector(to) {
            self.erase_sector(sector)?;
        }
        Ok(())
    }

    /// Program `bytes` at `offset`, one page program per page touched
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        Self::check_range(offset, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }

        for s in page_spans(0, FLASH_SIZE, offset, bytes.len() as u32) {
            self.write_page(&bytes[s.start..], s.page, s.offset, s.len)?;
        }
        Ok(())
    }
}

/// 24-bit big-endian address
fn address_bytes(address: u32) -> [u8; 3] {
    let [_, a2, a1, a0] = address.to_be_bytes();
    [a2, a1, a0]
}
