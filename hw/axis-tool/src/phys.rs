// Licensed under the Apache-2.0 license

//! Transfers against a fixed physical address, outside the DMA arena.

use crate::{open_device, parse_int};
use anyhow::{Context, Result};
use axis_uio::{host_page_size, CfgRegister, DeviceConfig, Direction, PhysWindow};
use clap::Args;
use std::path::PathBuf;

/// Physical address the streaming engine was validated against on the
/// reference board.
const DEFAULT_PHYS_ADDR: u64 = 0x1b90_0000;

#[derive(Args, Debug)]
pub(crate) struct PhysArgs {
    /// UIO device file
    #[arg(default_value = "/dev/axis")]
    device: PathBuf,

    /// Number of 32-bit words to transfer
    #[arg(short = 'n', long)]
    count: u32,

    /// Physical address of the transfer
    #[arg(short, long, value_parser = parse_int, default_value_t = DEFAULT_PHYS_ADDR)]
    addr: u64,

    /// Generic physical memory device
    #[arg(long, default_value = "/dev/mem")]
    mem: PathBuf,
}

impl PhysArgs {
    fn bus_addr(&self) -> Result<u32> {
        u32::try_from(self.addr)
            .with_context(|| format!("{:#x} is outside the 32-bit bus", self.addr))
    }
}

fn configure(dev: &axis_uio::AxisDevice, port: u32, args: &PhysArgs) -> Result<()> {
    anyhow::ensure!(args.count > 0, "count must be non-zero");
    println!("phys_addr: {:#x}, length: {}", args.addr, args.count);
    dev.cfg_write_sequence(
        &[
            usize::from(CfgRegister::AxisAddr),
            usize::from(CfgRegister::AxisData),
            usize::from(CfgRegister::AxisData),
        ],
        &[port, args.bus_addr()?, args.count],
    );
    Ok(())
}

/// Stream `count` words starting at the physical address and read them
/// through the source data register.
pub(crate) fn read(args: &PhysArgs, config: &DeviceConfig) -> Result<()> {
    let mut dev = open_device(&args.device, config)?;
    configure(&dev, dev.axis_port_id(0, Direction::Src), args)?;

    // The first read primes the data register.
    dev.cfg_read(CfgRegister::Hp0SrcData);
    let values: Vec<String> = (0..args.count)
        .map(|_| dev.cfg_read(CfgRegister::Hp0SrcData).to_string())
        .collect();
    println!("{}", values.join(" "));
    println!("hp0 src cnt: {}", dev.cfg_read(CfgRegister::Hp0SrcCnt));

    dev.exit()?;
    Ok(())
}

/// Push `1..=count` through the destination data register, then dump the
/// physical memory the engine wrote.
pub(crate) fn write(args: &PhysArgs, config: &DeviceConfig) -> Result<()> {
    let mut dev = open_device(&args.device, config)?;
    configure(&dev, dev.axis_port_id(0, Direction::Dst), args)?;

    let data: Vec<u32> = (1..=args.count).collect();
    dev.cfg_write_array(CfgRegister::Hp0DstData, &data);
    println!("hp0 dst cnt: {}", dev.cfg_read(CfgRegister::Hp0DstCnt));

    let len = args.count as usize * 4;
    let mem = PhysWindow::open(&args.mem, args.addr, len, host_page_size())
        .with_context(|| format!("failed to map {}", args.mem.display()))?;
    for i in 0..mem.word_count() {
        let value = mem.read32(i);
        println!(
            "{:6}, {:#010x}, hex: {value:x},\tdec: {value}",
            i + 1,
            mem.phys_addr() + (i as u64) * 4
        );
    }
    mem.close()?;

    dev.exit()?;
    Ok(())
}
