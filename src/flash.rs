//! Internal program flash.
//!
//! Page based access to the application region on top of the word level
//! primitives of the on-chip flash controller. Pages are always 512 bytes,
//! programmed and read as little-endian 32-bit words.

use crate::protocol::PAGE_SIZE;

pub const WORD_SIZE: u32 = 4;

pub const BOOTLOADER_END: u32 = 0x0000_FFFF;

pub const APP_START: u32 = 0x0001_0000;
pub const APP_END: u32 = 0x0007_FFFF;

/// Size of the hardware erase unit (4 x 4 KiB flash pages)
pub const ERASE_BLOCK_SIZE: u32 = 0x4000;

/// Application region of the default part (512 KiB flash, 64 KiB bootloader)
pub const APP_REGION: FlashRegion = FlashRegion::new(APP_START, APP_END, ERASE_BLOCK_SIZE);

/// Word level flash controller primitives
pub trait FlashUnit {
    type Error: core::fmt::Debug;

    /// Program one word at a word aligned address
    fn program_word(&mut self, address: u32, word: u32) -> Result<(), Self::Error>;

    /// Read one word at a word aligned address
    fn read_word(&mut self, address: u32) -> Result<u32, Self::Error>;

    /// Erase the erase block starting at `address`
    fn erase_block(&mut self, address: u32) -> Result<(), Self::Error>;

    /// Unlock the controller for programming (ISP enable)
    fn enable_update(&mut self) {}

    /// Lock the controller again
    fn disable_update(&mut self) {}
}

/// Static application region geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// First byte of the application region
    pub app_start: u32,
    /// Last byte of the application region (inclusive)
    pub app_end: u32,
    /// Page size used by the update protocol
    pub page_size: u32,
    /// Granule of [`FlashUnit::erase_block`]
    pub erase_block_size: u32,
}

impl FlashRegion {
    pub const fn new(app_start: u32, app_end: u32, erase_block_size: u32) -> Self {
        Self {
            app_start,
            app_end,
            page_size: PAGE_SIZE as u32,
            erase_block_size,
        }
    }

    pub fn size(&self) -> u32 {
        self.app_end - self.app_start + 1
    }

    /// Whether a whole page starting at `address` lies inside the region
    pub fn contains_page(&self, address: u32) -> bool {
        if address % WORD_SIZE != 0 || address < self.app_start {
            return false;
        }

        match address.checked_add(self.page_size - 1) {
            Some(last) => last <= self.app_end,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlashError<E> {
    #[error("flash access at 0x{address:08x} failed: {error:?}")]
    Hardware { address: u32, error: E },

    #[error("unsupported page size {0}")]
    UnsupportedPageSize(u16),

    #[error("{failed} of {total} erase blocks failed")]
    Erase { failed: u32, total: u32 },
}

/// Result of a page comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Match,
    /// First differing (or unreadable) word
    Mismatch { address: u32 },
}

/// Application region driver.
///
/// Addresses are not checked against the region here, callers only pass
/// pages for which [`FlashRegion::contains_page`] holds.
pub struct InternalFlash<F> {
    unit: F,
    region: FlashRegion,
}

impl<F: FlashUnit> InternalFlash<F> {
    pub fn new(unit: F, region: FlashRegion) -> Self {
        Self { unit, region }
    }

    pub fn region(&self) -> &FlashRegion {
        &self.region
    }

    pub fn unit(&self) -> &F {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut F {
        &mut self.unit
    }

    pub fn release(self) -> F {
        self.unit
    }

    /// Only the native 512 byte page is supported
    pub fn set_page_size(&mut self, size: u16) -> Result<(), FlashError<F::Error>> {
        if size as usize != PAGE_SIZE {
            return Err(FlashError::UnsupportedPageSize(size));
        }
        Ok(())
    }

    pub fn page_size(&self) -> u16 {
        PAGE_SIZE as u16
    }

    /// Program a page, stopping at the first failing word.
    ///
    /// There is no rollback, a failed page must be erased before retrying.
    pub fn write_page(
        &mut self,
        dest: u32,
        page: &[u8; PAGE_SIZE],
    ) -> Result<(), FlashError<F::Error>> {
        for (address, w) in words(dest).zip(page.chunks_exact(4)) {
            let word = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            self.unit
                .program_word(address, word)
                .map_err(|error| FlashError::Hardware { address, error })?;
        }

        Ok(())
    }

    /// Read a page, `page` is left partially filled on failure
    pub fn read_page(
        &mut self,
        src: u32,
        page: &mut [u8; PAGE_SIZE],
    ) -> Result<(), FlashError<F::Error>> {
        for (address, w) in words(src).zip(page.chunks_exact_mut(4)) {
            let word = self.read_word(address)?;
            w.copy_from_slice(&word.to_le_bytes());
        }

        Ok(())
    }

    pub fn verify_page(&mut self, src: u32, expected: &[u8; PAGE_SIZE]) -> Verification {
        for (address, w) in words(src).zip(expected.chunks_exact(4)) {
            let expected = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);

            match self.unit.read_word(address) {
                Ok(v) if v == expected => (),
                Ok(v) => {
                    debug!(
                        "Verify mismatch at 0x{:08x}: 0x{:08x} != 0x{:08x}",
                        address, v, expected
                    );
                    return Verification::Mismatch { address };
                }
                Err(e) => {
                    warn!("Verify read at 0x{:08x} failed: {:?}", address, e);
                    return Verification::Mismatch { address };
                }
            }
        }

        Verification::Match
    }

    /// Erase the whole application region.
    ///
    /// Every erase block is attempted even when earlier ones fail.
    pub fn erase_app_region(&mut self) -> Result<(), FlashError<F::Error>> {
        let mut total = 0;
        let mut failed = 0;
        let mut address = self.region.app_start;

        while address < self.region.app_end {
            if let Err(e) = self.unit.erase_block(address) {
                warn!("Erase of block 0x{:08x} failed: {:?}", address, e);
                failed += 1;
            }
            total += 1;

            address = match address.checked_add(self.region.erase_block_size) {
                Some(a) => a,
                None => break,
            };
        }

        debug!("Erased {} blocks from 0x{:08x}", total, self.region.app_start);

        match failed {
            0 => Ok(()),
            _ => Err(FlashError::Erase { failed, total }),
        }
    }

    pub fn read_word(&mut self, address: u32) -> Result<u32, FlashError<F::Error>> {
        self.unit
            .read_word(address)
            .map_err(|error| FlashError::Hardware { address, error })
    }
}

/// Word addresses of the page starting at `base`
fn words(base: u32) -> impl Iterator<Item = u32> {
    (0..PAGE_SIZE as u32)
        .step_by(WORD_SIZE as usize)
        .map(move |i| base.wrapping_add(i))
}
