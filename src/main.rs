//! Bootloader emulator.
//!
//! Serves the update protocol on a linux serial port with simulated
//! internal (and optionally external) flash, then writes out the resulting
//! application region instead of jumping to it.

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context};

use mcu_uart_bootloader::boot::{AppImage, ExternalImage, ImageSource};
use mcu_uart_bootloader::flash::{InternalFlash, APP_REGION};
use mcu_uart_bootloader::nor::W25q;
use mcu_uart_bootloader::sim::{SimFlash, SimNor};
use mcu_uart_bootloader::{Bootloader, Options, Outcome};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to serve the host on
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "38400")]
    baud: usize,

    /// Initial application region contents
    #[structopt(long)]
    image: Option<PathBuf>,

    /// File to write the application region to when the session ends
    #[structopt(long, default_value = "app.bin")]
    output: PathBuf,

    /// External flash contents, used by boot-from-external
    #[structopt(long)]
    external: Option<PathBuf>,

    /// Byte address of the image in external flash
    #[structopt(long, default_value = "0")]
    external_base: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let mut unit = SimFlash::new();
    if let Some(path) = &o.image {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        if data.len() > APP_REGION.size() as usize {
            return Err(anyhow!("image of {} bytes exceeds application region", data.len()));
        }
        unit.load(APP_REGION.app_start, &data);
        info!("Loaded {} byte image", data.len());
    }
    let flash = InternalFlash::new(unit, APP_REGION);

    info!("Opening serial port {} at {} baud", o.port, o.baud);

    let mut bl = Bootloader::linux(&o.port, o.baud, flash, o.options.clone())
        .map_err(|e| anyhow!("opening {}: {:?}", o.port, e))?;

    info!("Waiting for host");

    let outcome = loop {
        match bl.run() {
            Ok(outcome) => break outcome,
            Err(e) => warn!("Session failed ({:?}), restarting", e),
        }
    };

    let (_port, _delay, mut flash) = bl.release();

    if outcome == Outcome::BootFromExternal {
        let sim = SimNor::new();
        if let Some(path) = &o.external {
            let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            sim.load(0, &data);
        }

        let mut nor = W25q::new(sim.spi(), sim.cs()).with_poll_limit(o.options.busy_poll_limit);
        nor.init().map_err(|e| anyhow!("external flash init: {:?}", e))?;

        let pages = ExternalImage::new(nor, o.external_base).load(&mut flash)?;
        info!("Installed {} pages from external flash", pages);
    }

    let image = AppImage::read(&mut flash).map_err(|e| anyhow!("{:?}", e))?;
    info!(
        "Application vectors: sp {}, reset {}",
        hex::encode(image.stack_pointer.to_be_bytes()),
        hex::encode(image.reset_vector.to_be_bytes())
    );
    if image.looks_erased() {
        warn!("Application vectors look erased");
    }

    let region = *flash.region();
    let unit = flash.unit();
    fs::write(&o.output, unit.slice(region.app_start, region.size() as usize))
        .with_context(|| format!("writing {}", o.output.display()))?;

    info!("Wrote application region to {}", o.output.display());

    Ok(())
}
