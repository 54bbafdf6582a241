use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::flash::{FlashUnit, InternalFlash};
use crate::{Bootloader, Options};

impl<F: FlashUnit> Bootloader<Serial, Delay, F, IoErrorKind> {
    /// Create a bootloader serving the host on a linux serial port (8N1)
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        flash: InternalFlash<F>,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        Ok(Self::new(port, Delay {}, flash, options))
    }
}
