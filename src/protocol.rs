//! Wire protocol definitions.
//!
//! ```text
//! [0xA5][0xA5][0xA5][CMD][LEN_HI][LEN_LO][DATA; LEN][CHECKSUM]
//! ```
//!
//! `CHECKSUM` is the wrapping 8-bit sum of `DATA`. Integers carried inside
//! `DATA` (addresses, page sizes) are little-endian.

use core::convert::TryFrom;

/// Frame marker, sent three times at the start of every packet
pub const HEADER: u8 = 0xA5;
pub const HEADER_LEN: usize = 3;

pub const STATUS_OK: u8 = 0;
pub const STATUS_FAILED: u8 = 1;

pub const ACK: u8 = STATUS_OK;
pub const NACK: u8 = STATUS_FAILED;

/// Version reported in response to [`Command::CheckProtocol`]
pub const PROTOCOL_VERSION: u8 = 1;

/// Internal flash page transferred by one write / read request
pub const PAGE_SIZE: usize = 512;

/// Address prefix carried by flash write / read / verify requests
pub const ADDRESS_LEN: usize = 4;

/// Packet buffer capacity, sized for the largest request (address + page)
pub const BUFFER_SIZE: usize = ADDRESS_LEN + PAGE_SIZE;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Command {
    /// Handshake, returns the protocol version
    CheckProtocol = 0x01,

    /// Returns the device identifier
    CheckDevice = 0x02,

    /// Ends the session and starts the application
    ProgramEnd = 0x03,

    /// Ends the session, loads the application from external flash and starts it
    BootFromExternal = 0x04,

    /// Sets the flash page size used by write / read / verify (only 512 is accepted)
    FlashSetPageSize = 0x10,

    /// Returns the flash page size
    FlashGetPageSize = 0x11,

    /// Writes one page: 4 byte address followed by the page content
    FlashWrite = 0x12,

    /// Reads one page at the 4 byte address, the response carries the page content
    FlashRead = 0x13,

    /// Compares one page at the 4 byte address with the supplied content
    FlashVerify = 0x14,

    /// Erases a single flash sector
    FlashEraseSector = 0x15,

    /// Erases the whole application region
    FlashEraseAll = 0x16,

    EepromSetPageSize = 0x20,
    EepromGetPageSize = 0x21,
    EepromWrite = 0x22,
    EepromRead = 0x23,
    EepromVerify = 0x24,
    EepromEraseSector = 0x25,
    EepromEraseAll = 0x26,

    /// Opens the boot image file on the external flash filesystem
    ExtFlashOpen = 0x30,
    /// Closes the boot image file
    ExtFlashClose = 0x31,
    ExtFlashWrite = 0x32,
    ExtFlashRead = 0x33,
    ExtFlashVerify = 0x34,
    ExtFlashEraseSector = 0x35,
    /// Deletes the boot image file
    ExtFlashDelete = 0x36,
}

impl TryFrom<u8> for Command {
    /// The unrecognised command byte
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use Command::*;

        let c = match v {
            0x01 => CheckProtocol,
            0x02 => CheckDevice,
            0x03 => ProgramEnd,
            0x04 => BootFromExternal,

            0x10 => FlashSetPageSize,
            0x11 => FlashGetPageSize,
            0x12 => FlashWrite,
            0x13 => FlashRead,
            0x14 => FlashVerify,
            0x15 => FlashEraseSector,
            0x16 => FlashEraseAll,

            0x20 => EepromSetPageSize,
            0x21 => EepromGetPageSize,
            0x22 => EepromWrite,
            0x23 => EepromRead,
            0x24 => EepromVerify,
            0x25 => EepromEraseSector,
            0x26 => EepromEraseAll,

            0x30 => ExtFlashOpen,
            0x31 => ExtFlashClose,
            0x32 => ExtFlashWrite,
            0x33 => ExtFlashRead,
            0x34 => ExtFlashVerify,
            0x35 => ExtFlashEraseSector,
            0x36 => ExtFlashDelete,

            _ => return Err(v),
        };

        Ok(c)
    }
}

/// Single request / response packet.
///
/// One instance is reused for every turn of a session, responses are built
/// in place over the request that caused them.
#[derive(Clone)]
pub struct Packet {
    pub command: u8,
    pub length: u16,
    pub data: [u8; BUFFER_SIZE],
}

impl Packet {
    pub const fn new() -> Self {
        Self {
            command: 0,
            length: 0,
            data: [0u8; BUFFER_SIZE],
        }
    }

    /// Build a packet from a command and payload, `None` if the payload does not fit
    pub fn with_payload(command: u8, payload: &[u8]) -> Option<Self> {
        let mut p = Self::new();
        p.command = command;
        p.set_payload(payload)?;
        Some(p)
    }

    /// Active payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }

    /// Replace the payload, leaving the command byte untouched
    pub fn set_payload(&mut self, payload: &[u8]) -> Option<()> {
        let d = self.data.get_mut(..payload.len())?;
        d.copy_from_slice(payload);
        self.length = payload.len() as u16;
        Some(())
    }

    /// Replace the payload with a single status byte
    pub fn set_status(&mut self, status: u8) {
        self.data[0] = status;
        self.length = 1;
    }

    /// Little-endian address at the start of the payload
    pub fn address(&self) -> Option<u32> {
        let a = self.payload().get(..ADDRESS_LEN)?;
        Some(u32::from_le_bytes([a[0], a[1], a[2], a[3]]))
    }

    /// Page content following the address, `None` unless a full page was sent
    pub fn page(&self) -> Option<&[u8; PAGE_SIZE]> {
        let p = self.payload().get(ADDRESS_LEN..ADDRESS_LEN + PAGE_SIZE)?;
        <&[u8; PAGE_SIZE]>::try_from(p).ok()
    }

    /// Page area of a read response, following the status byte
    pub fn response_page_mut(&mut self) -> Option<&mut [u8; PAGE_SIZE]> {
        let p = self.data.get_mut(1..1 + PAGE_SIZE)?;
        <&mut [u8; PAGE_SIZE]>::try_from(p).ok()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("command", &self.command)
            .field("length", &self.length)
            .finish()
    }
}

/// Wrapping 8-bit sum over the payload
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Encode a complete frame into `buff`, returning the encoded length
pub fn encode(command: u8, payload: &[u8], buff: &mut [u8]) -> Option<usize> {
    let n = HEADER_LEN + 3 + payload.len() + 1;
    if payload.len() > BUFFER_SIZE || buff.len() < n {
        return None;
    }

    buff[..HEADER_LEN].copy_from_slice(&[HEADER; HEADER_LEN]);
    buff[3] = command;
    buff[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    buff[6..6 + payload.len()].copy_from_slice(payload);
    buff[n - 1] = checksum(payload);

    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes() {
        assert_eq!(Command::try_from(0x01), Ok(Command::CheckProtocol));
        assert_eq!(Command::try_from(0x16), Ok(Command::FlashEraseAll));
        assert_eq!(Command::try_from(0x26), Ok(Command::EepromEraseAll));
        assert_eq!(Command::try_from(0x36), Ok(Command::ExtFlashDelete));

        for c in &[0x00, 0x05, 0x17, 0x27, 0x37, 0xFF] {
            assert_eq!(Command::try_from(*c), Err(*c));
        }

        assert_eq!(Command::FlashWrite as u8, 0x12);
    }

    #[test]
    fn checksum_wraps() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), 0x06);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[0x80; 4]), 0x00);
    }

    #[test]
    fn encode_frame() {
        let mut buff = [0u8; 16];
        let n = encode(0x11, &[0x00, 0x00, 0x02], &mut buff).unwrap();

        assert_eq!(
            &buff[..n],
            &[0xA5, 0xA5, 0xA5, 0x11, 0x00, 0x03, 0x00, 0x00, 0x02, 0x02]
        );

        assert_eq!(encode(0x11, &[0u8; 16], &mut buff), None);
    }

    #[test]
    fn packet_fields() {
        let mut payload = [0u8; BUFFER_SIZE];
        payload[..4].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        for (i, b) in payload[4..].iter_mut().enumerate() {
            *b = i as u8;
        }

        let p = Packet::with_payload(0x12, &payload).unwrap();
        assert_eq!(p.address(), Some(0x0001_0000));
        assert_eq!(p.page().unwrap()[..], payload[4..]);

        let short = Packet::with_payload(0x12, &payload[..100]).unwrap();
        assert_eq!(short.page(), None);
        assert_eq!(Packet::new().address(), None);

        assert!(Packet::with_payload(0x12, &[0u8; BUFFER_SIZE + 1]).is_none());
    }

    #[test]
    fn status_keeps_command() {
        let mut p = Packet::with_payload(0x13, &[1, 2, 3, 4]).unwrap();
        p.set_status(NACK);

        assert_eq!(p.command, 0x13);
        assert_eq!(p.payload(), &[NACK]);
    }
}
