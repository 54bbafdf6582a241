//! Serial update bootloader.
//!
//! Host driven firmware update engine: a framed packet protocol over a byte
//! serial port, internal flash and SPI NOR flash drivers, and the boot
//! sequencer that decides between an update session and the application.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::convert::TryFrom;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

pub mod boot;
pub mod flash;
pub mod link;
pub mod nor;
pub mod protocol;

#[cfg(any(test, feature = "std"))]
pub mod sim;

#[cfg(feature = "linux")]
pub mod linux;

use flash::{FlashUnit, InternalFlash, Verification};
use link::Link;
use protocol::{Command, Packet, PAGE_SIZE, PROTOCOL_VERSION, STATUS_OK};

/// Board identifier reported by [`Command::CheckDevice`]
pub const DEVICE_ID: u8 = 2;

/// Byte transport to the host
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Waiting for the protocol check that opens a session
    AwaitHandshake,
    /// Executing host commands
    CommandLoop,
    /// Session ended, the processor accepts no further commands
    Terminated,
}

/// How a session ended
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Outcome {
    /// Start the application already in internal flash
    Run,
    /// Load the application from external flash, then start it
    BootFromExternal,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("unexpected header byte 0x{0:02x}")]
    BadHeader(u8),

    #[error("checksum mismatch (received 0x{expected:02x}, computed 0x{actual:02x})")]
    Checksum { expected: u8, actual: u8 },

    #[error("packet length {0} exceeds buffer")]
    Oversize(u16),

    #[error("receive timeout")]
    ResponseTimeout,

    #[error("session already terminated")]
    SessionEnded,
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError> Error<SerialError> {
    /// Errors that lose the current frame but leave the session intact
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Error::Serial(_) | Error::BadHeader(_) | Error::Checksum { .. } | Error::Oversize(_)
        )
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Give up waiting for host bytes after this period (blocks forever when unset)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub receive_timeout_ms: Option<u32>,

    /// Period to poll the serial port while a receive timeout is set
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Device identifier reported to the host
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2"))]
    pub device_id: u8,

    /// Maximum external flash status polls per operation (unbounded when unset)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub busy_poll_limit: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            receive_timeout_ms: None,
            poll_delay_ms: 1,
            device_id: DEVICE_ID,
            busy_poll_limit: None,
        }
    }
}

/// Update session command processor.
///
/// Owns the host link, the internal flash driver and the single packet
/// buffer reused for every request / response turn.
pub struct Bootloader<P, D, F, E> {
    state: State,
    options: Options,
    link: Link<P, D, E>,
    flash: InternalFlash<F>,
    packet: Packet,
}

impl<P, D, F, E> Bootloader<P, D, F, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    F: FlashUnit,
    E: core::fmt::Debug,
{
    /// Create a new bootloader instance
    pub fn new(port: P, delay: D, flash: InternalFlash<F>, options: Options) -> Self {
        let link = Link::new(port, delay, &options);

        Self {
            state: State::AwaitHandshake,
            options,
            link,
            flash,
            packet: Packet::new(),
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn flash(&self) -> &InternalFlash<F> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut InternalFlash<F> {
        &mut self.flash
    }

    /// Release the port, delay and flash driver
    pub fn release(self) -> (P, D, InternalFlash<F>) {
        let (port, delay) = self.link.release();
        (port, delay, self.flash)
    }

    /// Execute the session until the host ends it.
    ///
    /// Framing errors are dropped silently. Only a receive timeout (when
    /// configured) or a transmit failure returns early, in which case the
    /// session may be resumed by calling `run` again.
    pub fn run(&mut self) -> Result<Outcome, Error<E>> {
        if self.state == State::Terminated {
            return Err(Error::SessionEnded);
        }

        self.flash.unit_mut().enable_update();
        let res = self.session();
        self.flash.unit_mut().disable_update();

        res
    }

    fn session(&mut self) -> Result<Outcome, Error<E>> {
        loop {
            if let Some(outcome) = self.poll()? {
                return Ok(outcome);
            }
        }
    }

    /// Receive and handle a single packet
    pub fn poll(&mut self) -> Result<Option<Outcome>, Error<E>> {
        match self.state {
            State::AwaitHandshake => {
                self.receive()?;
                self.handshake()?;
                Ok(None)
            }
            State::CommandLoop => {
                self.receive()?;
                let outcome = self.dispatch()?;
                if let Some(o) = outcome {
                    info!("Session ended: {:?}", o);
                    self.state = State::Terminated;
                }
                Ok(outcome)
            }
            State::Terminated => Err(Error::SessionEnded),
        }
    }

    fn receive(&mut self) -> Result<(), Error<E>> {
        loop {
            match self.link.receive_packet(&mut self.packet) {
                Ok(()) => return Ok(()),
                Err(e @ Error::BadHeader(_)) => trace!("Resync: {:?}", e),
                Err(e) if e.is_framing() => warn!("Dropping packet: {:?}", e),
                Err(e) => return Err(e),
            }
        }
    }

    fn handshake(&mut self) -> Result<(), Error<E>> {
        if self.packet.command != Command::CheckProtocol as u8 {
            debug!(
                "Command 0x{:02x} before handshake, rejecting",
                self.packet.command
            );
            return self.link.send_nack(&mut self.packet);
        }

        self.respond(&[STATUS_OK, PROTOCOL_VERSION])?;

        info!("Host connected");
        self.state = State::CommandLoop;

        Ok(())
    }

    fn dispatch(&mut self) -> Result<Option<Outcome>, Error<E>> {
        let command = match Command::try_from(self.packet.command) {
            Ok(c) => c,
            Err(c) => {
                warn!("Unrecognised command 0x{:02x}", c);
                self.link.send_nack(&mut self.packet)?;
                return Ok(None);
            }
        };

        debug!("Command: {:?} ({} bytes)", command, self.packet.length);

        use Command::*;

        match command {
            CheckProtocol => self.respond(&[STATUS_OK, PROTOCOL_VERSION])?,
            CheckDevice => {
                let id = self.options.device_id;
                self.respond(&[STATUS_OK, id])?
            }
            ProgramEnd => {
                self.link.send_ack(&mut self.packet)?;
                return Ok(Some(Outcome::Run));
            }
            BootFromExternal => {
                self.link.send_ack(&mut self.packet)?;
                return Ok(Some(Outcome::BootFromExternal));
            }
            FlashSetPageSize => {
                let ok = self.set_page_size();
                self.reply(ok)?
            }
            FlashGetPageSize => {
                let [lo, hi] = self.flash.page_size().to_le_bytes();
                self.respond(&[STATUS_OK, lo, hi])?
            }
            FlashWrite => {
                let ok = self.write_page();
                self.reply(ok)?
            }
            FlashRead => {
                if self.read_page() {
                    self.packet.data[0] = STATUS_OK;
                    self.packet.length = 1 + PAGE_SIZE as u16;
                    self.link.send_packet(&self.packet)?
                } else {
                    self.link.send_nack(&mut self.packet)?
                }
            }
            FlashVerify => {
                let ok = self.verify_page();
                self.reply(ok)?
            }
            FlashEraseAll => {
                let ok = match self.flash.erase_app_region() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Erase failed: {:?}", e);
                        false
                    }
                };
                self.reply(ok)?
            }
            FlashEraseSector
            | EepromSetPageSize
            | EepromGetPageSize
            | EepromWrite
            | EepromRead
            | EepromVerify
            | EepromEraseSector
            | EepromEraseAll
            | ExtFlashOpen
            | ExtFlashClose
            | ExtFlashWrite
            | ExtFlashRead
            | ExtFlashVerify
            | ExtFlashEraseSector
            | ExtFlashDelete => {
                debug!("Command {:?} not supported", command);
                self.link.send_nack(&mut self.packet)?
            }
        }

        Ok(None)
    }

    /// Send `payload` as the response, keeping the request command byte
    fn respond(&mut self, payload: &[u8]) -> Result<(), Error<E>> {
        self.packet.data[..payload.len()].copy_from_slice(payload);
        self.packet.length = payload.len() as u16;
        self.link.send_packet(&self.packet)
    }

    fn reply(&mut self, ok: bool) -> Result<(), Error<E>> {
        if ok {
            self.link.send_ack(&mut self.packet)
        } else {
            self.link.send_nack(&mut self.packet)
        }
    }

    fn set_page_size(&mut self) -> bool {
        let size = match self.packet.payload() {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => return false,
        };

        match self.flash.set_page_size(size) {
            Ok(()) => true,
            Err(e) => {
                debug!("{:?}", e);
                false
            }
        }
    }

    /// Address from the request, if it names a page inside the application region
    fn page_address(&self) -> Option<u32> {
        let address = self.packet.address()?;

        if !self.flash.region().contains_page(address) {
            warn!(
                "Page 0x{:08x} outside application region {:?}",
                address,
                self.flash.region()
            );
            return None;
        }

        Some(address)
    }

    fn write_page(&mut self) -> bool {
        let address = match self.page_address() {
            Some(a) => a,
            None => return false,
        };
        let page = match self.packet.page() {
            Some(p) => p,
            None => return false,
        };

        match self.flash.write_page(address, page) {
            Ok(()) => true,
            Err(e) => {
                warn!("Write failed: {:?}", e);
                false
            }
        }
    }

    fn read_page(&mut self) -> bool {
        let address = match self.page_address() {
            Some(a) => a,
            None => return false,
        };
        let page = match self.packet.response_page_mut() {
            Some(p) => p,
            None => return false,
        };

        match self.flash.read_page(address, page) {
            Ok(()) => true,
            Err(e) => {
                warn!("Read failed: {:?}", e);
                false
            }
        }
    }

    fn verify_page(&mut self) -> bool {
        let address = match self.page_address() {
            Some(a) => a,
            None => return false,
        };
        let page = match self.packet.page() {
            Some(p) => p,
            None => return false,
        };

        self.flash.verify_page(address, page) == Verification::Match
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashRegion, APP_REGION};
    use crate::protocol::{encode, ACK, BUFFER_SIZE, NACK};
    use crate::sim::{SimFlash, SimSerial};

    use core::convert::Infallible;
    use embedded_hal_mock::delay::MockNoop;

    type TestBootloader = Bootloader<SimSerial, MockNoop, SimFlash, Infallible>;

    fn bootloader() -> (TestBootloader, SimSerial) {
        let serial = SimSerial::new();
        let flash = InternalFlash::new(unlocked(), APP_REGION);
        let options = Options {
            receive_timeout_ms: Some(5),
            ..Options::default()
        };

        (
            Bootloader::new(serial.clone(), MockNoop::new(), flash, options),
            serial,
        )
    }

    /// Flash as left by `run`, for tests driving `poll` directly
    fn unlocked() -> SimFlash {
        let mut f = SimFlash::new();
        f.enable_update();
        f
    }

    fn send(serial: &SimSerial, command: u8, payload: &[u8]) {
        let mut buff = [0u8; BUFFER_SIZE + 7];
        let n = encode(command, payload, &mut buff).unwrap();
        serial.push(&buff[..n]);
    }

    /// Split transmitted bytes into (command, payload) responses
    fn responses(serial: &SimSerial) -> Vec<(u8, Vec<u8>)> {
        let out = serial.take_output();
        let mut res = vec![];
        let mut i = 0;

        while i < out.len() {
            assert_eq!(&out[i..i + 3], &[0xA5, 0xA5, 0xA5]);
            let len = u16::from_be_bytes([out[i + 4], out[i + 5]]) as usize;
            let payload = out[i + 6..i + 6 + len].to_vec();
            assert_eq!(out[i + 6 + len], protocol::checksum(&payload));
            res.push((out[i + 3], payload));
            i += 7 + len;
        }

        res
    }

    fn handshake(bl: &mut TestBootloader, serial: &SimSerial) {
        send(serial, 0x01, &[]);
        bl.poll().unwrap();
        assert_eq!(responses(serial), vec![(0x01, vec![0, 1])]);
    }

    fn write_request(address: u32, page: &[u8]) -> Vec<u8> {
        let mut req = address.to_le_bytes().to_vec();
        req.extend_from_slice(page);
        req
    }

    fn pattern() -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| (i * 3 + 1) as u8).collect()
    }

    #[test]
    fn handshake_enters_command_loop() {
        let (mut bl, serial) = bootloader();
        assert_eq!(bl.state(), State::AwaitHandshake);

        handshake(&mut bl, &serial);

        assert_eq!(bl.state(), State::CommandLoop);
    }

    #[test]
    fn commands_rejected_before_handshake() {
        let (mut bl, serial) = bootloader();

        send(&serial, 0x13, &0x0001_0000u32.to_le_bytes());
        send(&serial, 0x03, &[]);
        bl.poll().unwrap();
        bl.poll().unwrap();

        assert_eq!(
            responses(&serial),
            vec![(0x13, vec![NACK]), (0x03, vec![NACK])]
        );
        assert_eq!(bl.state(), State::AwaitHandshake);
    }

    #[test]
    fn corrupt_frames_get_no_response() {
        let (mut bl, serial) = bootloader();

        // Noise, a bad checksum, then a valid handshake
        serial.push(&[0x00, 0x13]);
        serial.push(&[0xA5, 0xA5, 0xA5, 0x01, 0x00, 0x01, 0x10, 0x11]);
        send(&serial, 0x01, &[]);

        bl.poll().unwrap();

        assert_eq!(responses(&serial), vec![(0x01, vec![0, 1])]);
        assert_eq!(bl.state(), State::CommandLoop);
    }

    #[test]
    fn device_and_page_size() {
        let (mut bl, serial) = bootloader();
        handshake(&mut bl, &serial);

        send(&serial, 0x02, &[]);
        send(&serial, 0x11, &[]);
        send(&serial, 0x10, &512u16.to_le_bytes());
        send(&serial, 0x10, &256u16.to_le_bytes());
        send(&serial, 0x10, &[]);
        for _ in 0..5 {
            bl.poll().unwrap();
        }

        assert_eq!(
            responses(&serial),
            vec![
                (0x02, vec![0, DEVICE_ID]),
                (0x11, vec![0, 0x00, 0x02]),
                (0x10, vec![ACK]),
                (0x10, vec![NACK]),
                (0x10, vec![NACK]),
            ]
        );
    }

    #[test]
    fn write_then_read_page() {
        let (mut bl, serial) = bootloader();
        handshake(&mut bl, &serial);

        let page = pattern();
        send(&serial, 0x12, &write_request(0x0001_0000, &page));
        send(&serial, 0x13, &0x0001_0000u32.to_le_bytes());
        bl.poll().unwrap();
        bl.poll().unwrap();

        let r = responses(&serial);
        assert_eq!(r[0], (0x12, vec![ACK]));
        assert_eq!(r[1].0, 0x13);
        assert_eq!(r[1].1[0], STATUS_OK);
        assert_eq!(&r[1].1[1..], &page[..]);
    }

    #[test]
    fn verify_page() {
        let (mut bl, serial) = bootloader();
        handshake(&mut bl, &serial);

        let page = pattern();
        let mut other = page.clone();
        other[100] ^= 0xFF;

        send(&serial, 0x12, &write_request(0x0002_0000, &page));
        send(&serial, 0x14, &write_request(0x0002_0000, &page));
        send(&serial, 0x14, &write_request(0x0002_0000, &other));
        for _ in 0..3 {
            bl.poll().unwrap();
        }

        assert_eq!(
            responses(&serial),
            vec![(0x12, vec![ACK]), (0x14, vec![ACK]), (0x14, vec![NACK])]
        );
    }

    #[test]
    fn pages_outside_app_region_rejected() {
        let (mut bl, serial) = bootloader();
        handshake(&mut bl, &serial);

        let page = pattern();
        // Bootloader region, straddling the end of flash, and unaligned
        send(&serial, 0x12, &write_request(0x0000_0000, &page));
        send(&serial, 0x12, &write_request(0x0007_FF00, &page));
        send(&serial, 0x12, &write_request(0x0001_0002, &page));
        send(&serial, 0x13, &0x0000_FE00u32.to_le_bytes());
        // Truncated write
        send(&serial, 0x12, &write_request(0x0001_0000, &page[..10]));
        for _ in 0..5 {
            bl.poll().unwrap();
        }

        for (_, payload) in responses(&serial) {
            assert_eq!(payload, vec![NACK]);
        }

        let erased = [0xFFu8; PAGE_SIZE];
        let flash = bl.flash().unit();
        assert_eq!(flash.slice(0x0000_0000, PAGE_SIZE), &erased[..]);
        assert_eq!(flash.slice(0x0001_0000, PAGE_SIZE), &erased[..]);
    }

    #[test]
    fn hardware_failure_nacks() {
        let (mut bl, serial) = bootloader();
        handshake(&mut bl, &serial);

        bl.flash_mut().unit_mut().fail_program_at(Some(0x0001_0100));

        send(&serial, 0x12, &write_request(0x0001_0000, &pattern()));
        send(&serial, 0x02, &[]);
        bl.poll().unwrap();
        bl.poll().unwrap();

        assert_eq!(
            responses(&serial),
            vec![(0x12, vec![NACK]), (0x02, vec![0, DEVICE_ID])]
        );
        assert_eq!(bl.state(), State::CommandLoop);
    }

    #[test]
    fn read_failure_nacks() {
        let (mut bl, serial) = bootloader();
        handshake(&mut bl, &serial);

        bl.flash_mut().unit_mut().fail_read_at(Some(0x0001_0008));

        send(&serial, 0x13, &0x0001_0000u32.to_le_bytes());
        send(&serial, 0x13, &0x0001_0200u32.to_le_bytes());
        bl.poll().unwrap();
        bl.poll().unwrap();

        let r = responses(&serial);
        assert_eq!(r[0], (0x13, vec![NACK]));
        assert_eq!(r[1].1.len(), 1 + PAGE_SIZE);
        assert_eq!(r[1].1[0], STATUS_OK);
        assert_eq!(bl.state(), State::CommandLoop);
    }

    #[test]
    fn erase_failure_nacks() {
        let (mut bl, serial) = bootloader();
        handshake(&mut bl, &serial);

        send(&serial, 0x12, &write_request(0x0004_0000, &pattern()));
        bl.poll().unwrap();
        bl.flash_mut().unit_mut().fail_erase_at(Some(0x0002_0000));

        send(&serial, 0x16, &[]);
        send(&serial, 0x02, &[]);
        bl.poll().unwrap();
        bl.poll().unwrap();

        assert_eq!(
            responses(&serial),
            vec![
                (0x12, vec![ACK]),
                (0x16, vec![NACK]),
                (0x02, vec![0, DEVICE_ID])
            ]
        );
        assert_eq!(bl.state(), State::CommandLoop);

        // Blocks after the failed one were still erased
        assert!(bl
            .flash()
            .unit()
            .slice(0x0004_0000, PAGE_SIZE)
            .iter()
            .all(|b| *b == 0xFF));
    }

    #[test]
    fn erase_all() {
        let (mut bl, serial) = bootloader();
        handshake(&mut bl, &serial);

        send(&serial, 0x12, &write_request(0x0004_0000, &pattern()));
        send(&serial, 0x16, &[]);
        bl.poll().unwrap();
        bl.poll().unwrap();

        assert_eq!(
            responses(&serial),
            vec![(0x12, vec![ACK]), (0x16, vec![ACK])]
        );
        assert!(bl
            .flash()
            .unit()
            .slice(0x0004_0000, PAGE_SIZE)
            .iter()
            .all(|b| *b == 0xFF));
    }

    #[test]
    fn unsupported_and_unknown_commands() {
        let (mut bl, serial) = bootloader();

        send(&serial, 0xFF, &[]);
        bl.poll().unwrap();
        handshake_after(&mut bl, &serial);

        for c in &[0xFFu8, 0x15, 0x20, 0x23, 0x26, 0x30, 0x33, 0x36, 0x05] {
            send(&serial, *c, &[1, 2, 3]);
            bl.poll().unwrap();
        }

        let r = responses(&serial);
        assert_eq!(r.len(), 9);
        for (_, payload) in r {
            assert_eq!(payload, vec![NACK]);
        }
    }

    fn handshake_after(bl: &mut TestBootloader, serial: &SimSerial) {
        assert_eq!(responses(serial), vec![(0xFF, vec![NACK])]);
        handshake(bl, serial);
    }

    #[test]
    fn program_end_terminates() {
        let (mut bl, serial) = bootloader();

        send(&serial, 0x01, &[]);
        send(&serial, 0x03, &[]);
        send(&serial, 0x02, &[]);

        assert_eq!(bl.run(), Ok(Outcome::Run));
        assert_eq!(bl.state(), State::Terminated);
        assert_eq!(
            responses(&serial),
            vec![(0x01, vec![0, 1]), (0x03, vec![ACK])]
        );

        assert_eq!(bl.run(), Err(Error::SessionEnded));
        assert_eq!(bl.poll(), Err(Error::SessionEnded));
        assert!(responses(&serial).is_empty());
        assert_eq!(serial.pending(), 7);
    }

    #[test]
    fn boot_from_external_terminates() {
        let (mut bl, serial) = bootloader();

        send(&serial, 0x01, &[]);
        send(&serial, 0x04, &[]);

        assert_eq!(bl.run(), Ok(Outcome::BootFromExternal));
        assert_eq!(bl.state(), State::Terminated);
    }

    #[test]
    fn silent_host_times_out_and_resumes() {
        let (mut bl, serial) = bootloader();

        send(&serial, 0x01, &[]);
        assert_eq!(bl.run(), Err(Error::ResponseTimeout));
        assert_eq!(bl.state(), State::CommandLoop);
        assert!(!bl.flash().unit().update_enabled());

        send(&serial, 0x03, &[]);
        assert_eq!(bl.run(), Ok(Outcome::Run));
    }

    #[test]
    fn custom_region() {
        let serial = SimSerial::new();
        let region = FlashRegion::new(0x0002_0000, 0x0002_03FF, 0x400);
        let flash = InternalFlash::new(unlocked(), region);
        let options = Options {
            receive_timeout_ms: Some(5),
            device_id: 7,
            ..Options::default()
        };
        let mut bl: TestBootloader =
            Bootloader::new(serial.clone(), MockNoop::new(), flash, options);

        handshake(&mut bl, &serial);
        send(&serial, 0x02, &[]);
        send(&serial, 0x12, &write_request(0x0002_0200, &pattern()));
        send(&serial, 0x12, &write_request(0x0002_0400, &pattern()));
        for _ in 0..3 {
            bl.poll().unwrap();
        }

        assert_eq!(
            responses(&serial),
            vec![(0x02, vec![0, 7]), (0x12, vec![ACK]), (0x12, vec![NACK])]
        );
    }
}
