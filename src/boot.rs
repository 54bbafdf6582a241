//! Boot sequencing.
//!
//! On reset the program-mode pin selects between starting the installed
//! application and running an update session. A session may end by asking
//! for the application to be reloaded from external flash first.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::{InputPin, OutputPin};

use crate::flash::{FlashError, FlashUnit, InternalFlash};
use crate::nor::{self, W25q};
use crate::protocol::{ADDRESS_LEN, BUFFER_SIZE, PAGE_SIZE};
use crate::{Bootloader, Error, Outcome, SerialPort};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Mode {
    /// Start the installed application
    Run,
    /// Run an update session
    Update,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Stage {
    ColdStart,
    ModeDetect,
    Run,
    Update,
}

/// Core specific control transfer
pub trait Processor {
    /// Hand control to the image whose vector table is at `base`
    fn jump(&mut self, base: u32) -> !;

    /// System reset
    fn reset(&mut self) -> !;
}

/// Cortex-M control transfer.
///
/// Leaves the core as close to its reset state as the application expects:
/// NVIC interrupts disabled and cleared, SysTick stopped, pending SysTick and
/// fault handler enables cleared, VTOR pointing at the application.
#[cfg(feature = "cortex-m")]
pub struct CortexM;

#[cfg(feature = "cortex-m")]
impl Processor for CortexM {
    fn jump(&mut self, base: u32) -> ! {
        use cortex_m::asm;

        const ICSR_PENDSTCLR: u32 = 1 << 25;
        const SHCSR_FAULT_ENABLES: u32 = 0b111 << 16;

        cortex_m::interrupt::disable();

        unsafe {
            let p = cortex_m::Peripherals::steal();

            for (icer, icpr) in p.NVIC.icer.iter().zip(p.NVIC.icpr.iter()).take(8) {
                icer.write(0xFFFF_FFFF);
                icpr.write(0xFFFF_FFFF);
            }

            p.SYST.csr.write(0);
            p.SCB.icsr.write(ICSR_PENDSTCLR);
            p.SCB.shcsr.modify(|v| v & !SHCSR_FAULT_ENABLES);

            asm::dsb();
            asm::isb();

            p.SCB.vtor.write(base);

            asm::dsb();
            asm::isb();

            cortex_m::interrupt::enable();

            asm::bootload(base as *const u32)
        }
    }

    fn reset(&mut self) -> ! {
        cortex_m::peripheral::SCB::sys_reset()
    }
}

/// First two words of the application vector table
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct AppImage {
    pub stack_pointer: u32,
    pub reset_vector: u32,
}

impl AppImage {
    pub fn read<F: FlashUnit>(flash: &mut InternalFlash<F>) -> Result<Self, FlashError<F::Error>> {
        let base = flash.region().app_start;

        Ok(Self {
            stack_pointer: flash.read_word(base)?,
            reset_vector: flash.read_word(base + 4)?,
        })
    }

    /// Either vector still reads as erased flash
    pub fn looks_erased(&self) -> bool {
        self.stack_pointer == 0xFFFF_FFFF || self.reset_vector == 0xFFFF_FFFF
    }
}

#[derive(Copy, Clone, PartialEq, Debug, thiserror::Error)]
pub enum BootError {
    #[error("no image in external flash")]
    NoImage,

    #[error("external image length {0} invalid")]
    BadLength(u32),

    #[error("external flash access failed")]
    External,

    #[error("application region erase failed")]
    Erase,

    #[error("programming page 0x{0:08x} failed")]
    Program(u32),

    #[error("image page 0x{0:08x} outside application region")]
    OutOfRegion(u32),

    #[error("no external image source")]
    Unavailable,
}

/// Source of an application image to install before starting it
pub trait ImageSource {
    /// Replace the application region contents, returning the pages written
    fn load<F: FlashUnit>(&mut self, flash: &mut InternalFlash<F>) -> Result<u32, BootError>;
}

/// Boards without external flash
pub struct NoExternal;

impl ImageSource for NoExternal {
    fn load<F: FlashUnit>(&mut self, _flash: &mut InternalFlash<F>) -> Result<u32, BootError> {
        Err(BootError::Unavailable)
    }
}

/// Application image stored in NOR flash.
///
/// At `base`: a little-endian u32 stream length, then the stream of
/// flash-write records, each a little-endian page address and one page.
pub struct ExternalImage<SPI, CS> {
    nor: W25q<SPI, CS>,
    base: u32,
}

impl<SPI, CS> ExternalImage<SPI, CS> {
    pub fn new(nor: W25q<SPI, CS>, base: u32) -> Self {
        Self { nor, base }
    }

    pub fn release(self) -> W25q<SPI, CS> {
        self.nor
    }
}

impl<SPI, CS, SE, PE> ExternalImage<SPI, CS>
where
    SPI: Transfer<u8, Error = SE> + Write<u8, Error = SE>,
    CS: OutputPin<Error = PE>,
    SE: core::fmt::Debug,
    PE: core::fmt::Debug,
{
    /// Byte length of the record stream, if an image is present
    pub fn stream_len(&mut self) -> Result<u32, BootError> {
        let mut len = [0u8; 4];
        self.nor.read_bytes(&mut len, self.base).map_err(|e| {
            error!("External image header read failed: {:?}", e);
            BootError::External
        })?;

        match u32::from_le_bytes(len) {
            0 | 0xFFFF_FFFF => Err(BootError::NoImage),
            n => Ok(n),
        }
    }

    /// Install the `len` byte record stream starting at NOR address `start`
    fn stream<F: FlashUnit>(
        &mut self,
        flash: &mut InternalFlash<F>,
        start: u32,
        len: u32,
    ) -> Result<u32, BootError> {
        flash.erase_app_region().map_err(|e| {
            error!("Erase before external load failed: {:?}", e);
            BootError::Erase
        })?;

        let mut record = [0u8; BUFFER_SIZE];
        let mut offset = 0;
        let mut pages = 0;

        while offset < len {
            let n = ((len - offset) as usize).min(BUFFER_SIZE);
            if n <= ADDRESS_LEN {
                return Err(BootError::BadLength(len));
            }

            for b in record[n..].iter_mut() {
                *b = 0;
            }
            self.nor
                .read_bytes(&mut record[..n], start + offset)
                .map_err(|e| {
                    error!("External image read at {} failed: {:?}", offset, e);
                    BootError::External
                })?;

            let address = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            if !flash.region().contains_page(address) {
                return Err(BootError::OutOfRegion(address));
            }

            let mut page = [0u8; PAGE_SIZE];
            page.copy_from_slice(&record[ADDRESS_LEN..]);
            flash.write_page(address, &page).map_err(|e| {
                error!("{:?}", e);
                BootError::Program(address)
            })?;

            trace!("Loaded page 0x{:08x}", address);

            pages += 1;
            offset += n as u32;
        }

        Ok(pages)
    }
}

impl<SPI, CS, SE, PE> ImageSource for ExternalImage<SPI, CS>
where
    SPI: Transfer<u8, Error = SE> + Write<u8, Error = SE>,
    CS: OutputPin<Error = PE>,
    SE: core::fmt::Debug,
    PE: core::fmt::Debug,
{
    fn load<F: FlashUnit>(&mut self, flash: &mut InternalFlash<F>) -> Result<u32, BootError> {
        let len = self.stream_len()?;

        let region = flash.region();
        let max = region.size() / region.page_size * BUFFER_SIZE as u32;
        let start = match self.base.checked_add(4) {
            Some(s) if len <= max && nor::in_range(s, len as usize) => s,
            _ => return Err(BootError::BadLength(len)),
        };

        info!("Loading {} byte image from external flash 0x{:06x}", len, self.base);

        flash.unit_mut().enable_update();
        let res = self.stream(flash, start, len);
        flash.unit_mut().disable_update();

        res
    }
}

/// Reset-time mode selection and control transfer
pub struct BootSequencer<PIN, CPU, SRC> {
    stage: Stage,
    pin: PIN,
    cpu: CPU,
    source: SRC,
}

impl<PIN, CPU, SRC, PE> BootSequencer<PIN, CPU, SRC>
where
    PIN: InputPin<Error = PE>,
    CPU: Processor,
    SRC: ImageSource,
    PE: core::fmt::Debug,
{
    pub fn new(pin: PIN, cpu: CPU, source: SRC) -> Self {
        Self {
            stage: Stage::ColdStart,
            pin,
            cpu,
            source,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Sample the program-mode pin, low requests an update session
    pub fn detect_mode(&mut self) -> Mode {
        self.stage = Stage::ModeDetect;

        let mode = match self.pin.is_low() {
            Ok(true) => Mode::Update,
            Ok(false) => Mode::Run,
            Err(e) => {
                warn!("Mode pin read failed ({:?}), staying in bootloader", e);
                Mode::Update
            }
        };

        info!("Boot mode: {:?}", mode);

        mode
    }

    /// Start the application in internal flash.
    ///
    /// The vector table is not validated, an erased image is only reported.
    pub fn launch<F: FlashUnit>(&mut self, flash: &mut InternalFlash<F>) -> ! {
        self.stage = Stage::Run;
        let base = flash.region().app_start;

        match AppImage::read(flash) {
            Ok(image) => {
                info!(
                    "Starting application at 0x{:08x} (sp: 0x{:08x}, reset: 0x{:08x})",
                    base, image.stack_pointer, image.reset_vector
                );
                if image.looks_erased() {
                    warn!("Application vectors look erased");
                }
            }
            Err(e) => warn!("Reading application vectors failed: {:?}", e),
        }

        self.cpu.jump(base)
    }

    /// Install the application from the image source
    pub fn load_external<F: FlashUnit>(
        &mut self,
        flash: &mut InternalFlash<F>,
    ) -> Result<u32, BootError> {
        let pages = self.source.load(flash)?;
        info!("Installed {} pages from external flash", pages);
        Ok(pages)
    }

    /// Run the boot sequence, never returns.
    ///
    /// In update mode the session is restarted after transport failures. A
    /// failed external load resets the system.
    pub fn start<P, D, F, E>(mut self, bootloader: &mut Bootloader<P, D, F, E>) -> !
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        F: FlashUnit,
        E: core::fmt::Debug,
    {
        if self.detect_mode() == Mode::Run {
            self.launch(bootloader.flash_mut());
        }

        self.stage = Stage::Update;
        loop {
            match bootloader.run() {
                Ok(Outcome::Run) | Err(Error::SessionEnded) => {
                    self.launch(bootloader.flash_mut());
                }
                Ok(Outcome::BootFromExternal) => {
                    match self.load_external(bootloader.flash_mut()) {
                        Ok(_) => self.launch(bootloader.flash_mut()),
                        Err(e) => {
                            error!("External load failed: {}", e);
                            self.cpu.reset();
                        }
                    }
                }
                Err(e) => warn!("Session failed ({:?}), restarting", e),
            }
        }
    }
}
