// Licensed under the Apache-2.0 license

//! Command-line driver for an AXI-Stream engine behind a UIO device.

mod phys;

use anyhow::{Context, Result};
use axis_uio::{AxisDevice, CfgRegister, DeviceConfig, Direction, AXIS_NB};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "axis-tool", author, version, about = "Drive an AXIS UIO device")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// TOML device configuration
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the device, report its windows and close it again
    Probe {
        /// UIO device file
        device: PathBuf,
    },
    /// Stream a counting pattern from DMA memory and read it back over the
    /// control bus
    StreamRead {
        device: PathBuf,
        /// Number of 32-bit words to stream
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,
        /// AXIS port index
        #[arg(short, long, default_value_t = 0)]
        port: usize,
    },
    /// Read one control register
    RegRead {
        device: PathBuf,
        #[arg(value_parser = parse_int)]
        index: u64,
    },
    /// Write one control register
    RegWrite {
        device: PathBuf,
        #[arg(value_parser = parse_int)]
        index: u64,
        #[arg(value_parser = parse_int)]
        value: u64,
    },
    /// Stream from a fixed physical address and read the data over the
    /// control bus
    PhysRead(phys::PhysArgs),
    /// Write a counting pattern over the control bus into a fixed physical
    /// address and dump it through the memory device
    PhysWrite(phys::PhysArgs),
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
pub(crate) fn parse_int(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid integer {s:?}: {e}"))
}

pub(crate) fn open_device(path: &Path, config: &DeviceConfig) -> Result<AxisDevice> {
    AxisDevice::open(path, config.clone())
        .with_context(|| format!("failed to open AXIS device {}", path.display()))
}

fn register_index(dev: &AxisDevice, index: u64) -> Result<usize> {
    let nb = dev.cfg().register_nb();
    usize::try_from(index)
        .ok()
        .filter(|i| *i < nb)
        .with_context(|| format!("register {index} outside 0..{nb}"))
}

fn probe(path: &Path, config: &DeviceConfig) -> Result<()> {
    let mut dev = open_device(path, config)?;
    println!("device:       {}", path.display());
    println!("page size:    {:#x}", dev.page_size());
    println!("registers:    {}", dev.cfg().register_nb());
    println!("DMA window:   {:#x} bytes", dev.arena().capacity());
    println!("DMA base:     {:#x}", dev.base_address());
    println!();
    print!("{}", dev.config().to_toml_string()?);
    dev.exit()?;
    Ok(())
}

fn stream_read(path: &Path, config: &DeviceConfig, count: usize, port: usize) -> Result<()> {
    anyhow::ensure!(count > 0, "count must be non-zero");
    anyhow::ensure!(port < AXIS_NB, "port {port} outside 0..{AXIS_NB}");

    let mut dev = open_device(path, config)?;
    {
        let mut array = dev.mem_alloc::<u32>(count)?;
        for (i, v) in array.iter_mut().enumerate() {
            *v = 100 + i as u32;
        }
        log::info!(
            "buffer at {:#x}, port id {}",
            dev.axis_memory_addr(&array),
            dev.axis_port_id(port, Direction::Src)
        );
        dev.stream_from(&array, port);

        println!("read start");
        // The first read primes the data register.
        dev.cfg_read(CfgRegister::Hp0SrcData);
        let values: Vec<String> = (0..count)
            .map(|_| dev.cfg_read(CfgRegister::Hp0SrcData).to_string())
            .collect();
        println!("{}", values.join(" "));
        println!("hp0 src cnt: {}", dev.cfg_read(CfgRegister::Hp0SrcCnt));
    }
    dev.exit()?;
    println!("done");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::new()
        .with_level(level)
        .init()
        .context("failed to initialize logger")?;

    let config = match &cli.config {
        Some(path) => DeviceConfig::from_file(path)?,
        None => DeviceConfig::default(),
    };

    match cli.command {
        Commands::Probe { device } => probe(&device, &config),
        Commands::StreamRead {
            device,
            count,
            port,
        } => stream_read(&device, &config, count, port),
        Commands::RegRead { device, index } => {
            let dev = open_device(&device, &config)?;
            let index = register_index(&dev, index)?;
            println!("{:#010x}", dev.cfg_read(index));
            Ok(())
        }
        Commands::RegWrite {
            device,
            index,
            value,
        } => {
            let dev = open_device(&device, &config)?;
            let index = register_index(&dev, index)?;
            let value = u32::try_from(value).context("register values are 32 bits")?;
            dev.cfg_write(index, value);
            Ok(())
        }
        Commands::PhysRead(args) => phys::read(&args, &config),
        Commands::PhysWrite(args) => phys::write(&args, &config),
    }
}
