//! Packet framing over a byte-at-a-time serial port

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{checksum, Packet, ACK, BUFFER_SIZE, HEADER, NACK};
use crate::{Error, Options, SerialPort};

/// Serial link to the host, frames and deframes [`Packet`]s
pub struct Link<P, D, E> {
    port: P,
    delay: D,
    receive_timeout_ms: Option<u32>,
    poll_delay_ms: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> Link<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, options: &Options) -> Self {
        Self {
            port,
            delay,
            receive_timeout_ms: options.receive_timeout_ms,
            poll_delay_ms: options.poll_delay_ms,
            _err: PhantomData,
        }
    }

    /// Release the underlying port and delay
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Receive a packet into `packet`.
    ///
    /// Marker bytes are checked as they arrive and the receive fails on the
    /// first mismatch, without reading further. The contents of `packet` are
    /// unspecified after a failure.
    pub fn receive_packet(&mut self, packet: &mut Packet) -> Result<(), Error<E>> {
        for _ in 0..3 {
            let b = self.get_byte()?;
            if b != HEADER {
                return Err(Error::BadHeader(b));
            }
        }

        packet.command = self.get_byte()?;

        let len_h = self.get_byte()?;
        let len_l = self.get_byte()?;
        let length = u16::from_be_bytes([len_h, len_l]);
        if length as usize > BUFFER_SIZE {
            return Err(Error::Oversize(length));
        }
        packet.length = length;

        let mut sum = 0u8;
        for i in 0..length as usize {
            let b = self.get_byte()?;
            packet.data[i] = b;
            sum = sum.wrapping_add(b);
        }

        let expected = self.get_byte()?;
        if expected != sum {
            return Err(Error::Checksum {
                expected,
                actual: sum,
            });
        }

        trace!(
            "Received command 0x{:02x} ({} bytes)",
            packet.command,
            packet.length
        );

        Ok(())
    }

    /// Send `packet` and flush the port
    pub fn send_packet(&mut self, packet: &Packet) -> Result<(), Error<E>> {
        for _ in 0..3 {
            self.put_byte(HEADER)?;
        }

        let [len_h, len_l] = packet.length.to_be_bytes();
        self.put_byte(packet.command)?;
        self.put_byte(len_h)?;
        self.put_byte(len_l)?;

        let payload = packet.payload();
        for b in payload {
            self.put_byte(*b)?;
        }
        self.put_byte(checksum(payload))?;

        block!(self.port.flush())?;

        trace!(
            "Sent response 0x{:02x} ({} bytes)",
            packet.command,
            packet.length
        );

        Ok(())
    }

    /// Overwrite the payload with an ACK status and send it.
    ///
    /// The command byte is echoed unchanged, receivers do not inspect it.
    pub fn send_ack(&mut self, packet: &mut Packet) -> Result<(), Error<E>> {
        packet.set_status(ACK);
        self.send_packet(packet)
    }

    /// Overwrite the payload with a NACK status and send it
    pub fn send_nack(&mut self, packet: &mut Packet) -> Result<(), Error<E>> {
        packet.set_status(NACK);
        self.send_packet(packet)
    }

    /// Read a single byte, blocking until one arrives or the receive timeout expires
    pub fn get_byte(&mut self) -> Result<u8, Error<E>> {
        let timeout = match self.receive_timeout_ms {
            Some(t) => t,
            None => return block!(self.port.read()).map_err(Error::Serial),
        };

        let mut t: u32 = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.poll_delay_ms);
            t = t.saturating_add(self.poll_delay_ms.max(1));

            if t >= timeout {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }

    /// Write a single byte
    pub fn put_byte(&mut self, b: u8) -> Result<(), Error<E>> {
        block!(self.port.write(b)).map_err(Error::Serial)
    }
}
