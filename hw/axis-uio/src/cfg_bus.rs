/*++

Licensed under the Apache-2.0 license.

File Name:

    cfg_bus.rs

Abstract:

    Indexed 32-bit register access to the control window. The window is
    written by the streaming engine behind our back, so every access is a
    single volatile load or store.

--*/

use crate::error::{AxisError, AxisResult};
use crate::mapper::ControlRegion;
use log::trace;
use std::time::{Duration, Instant};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;

/// Generic register layout of the streaming engine's control window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum CfgRegister {
    /// Port selector of the next transfer.
    AxisAddr = 0,
    /// Transfer configuration, written with a byte address then a word count.
    AxisData = 1,
    Hp0DstCnt = 2,
    Hp0SrcCnt = 3,
    Hp0DstData = 4,
    Hp0SrcData = 5,
}

impl From<CfgRegister> for usize {
    fn from(reg: CfgRegister) -> usize {
        reg as usize
    }
}

/// Register accessor borrowing an open control window.
///
/// Every access is bounds-checked against the window's register count, in
/// release builds too: an out-of-range register index panics rather than
/// touching memory outside the mapping.
#[derive(Clone, Copy)]
pub struct ConfigBus<'a> {
    regs: &'a [ReadWrite<u32>],
}

impl<'a> ConfigBus<'a> {
    pub fn new(region: &'a ControlRegion) -> Self {
        // SAFETY: the window is `register_nb * 4` bytes of page-aligned
        // mapped memory that stays mapped for the borrow of `region`.
        // ReadWrite<u32> is a transparent wrapper over a u32 cell.
        let regs = unsafe {
            std::slice::from_raw_parts(
                region.as_ptr() as *const ReadWrite<u32>,
                region.register_nb(),
            )
        };
        Self { regs }
    }

    /// Number of registers in the window.
    pub fn register_nb(&self) -> usize {
        self.regs.len()
    }

    fn reg(&self, addr: usize) -> &ReadWrite<u32> {
        match self.regs.get(addr) {
            Some(reg) => reg,
            None => panic!(
                "register {addr} outside the {} register control window",
                self.regs.len()
            ),
        }
    }

    pub fn write(&self, addr: impl Into<usize>, data: u32) {
        let addr = addr.into();
        trace!("cfg[{addr}] <- {data:#x}");
        self.reg(addr).set(data);
    }

    pub fn read(&self, addr: impl Into<usize>) -> u32 {
        let addr = addr.into();
        let data = self.reg(addr).get();
        trace!("cfg[{addr}] -> {data:#x}");
        data
    }

    /// Spin on register `addr` until it reads at least `threshold`, and
    /// return that value.
    ///
    /// With `timeout` set to `None` this waits for as long as the hardware
    /// takes, possibly forever.
    pub fn poll(
        &self,
        addr: impl Into<usize>,
        threshold: u32,
        timeout: Option<Duration>,
    ) -> AxisResult<u32> {
        let addr = addr.into();
        let reg = self.reg(addr);
        let start = Instant::now();
        loop {
            let value = reg.get();
            if value >= threshold {
                return Ok(value);
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(AxisError::PollTimeout {
                        addr,
                        threshold,
                        last: value,
                        timeout,
                    });
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Push every element of `data` through the single register `addr`.
    pub fn write_array(&self, addr: impl Into<usize>, data: &[u32]) {
        let reg = self.reg(addr.into());
        for value in data {
            reg.set(*value);
        }
    }

    /// Write `data[i]` to register `addrs[i]`, in order.
    pub fn write_sequence(&self, addrs: &[usize], data: &[u32]) {
        assert_eq!(
            addrs.len(),
            data.len(),
            "register and data sequences differ in length"
        );
        for (addr, value) in addrs.iter().zip(data) {
            self.write(*addr, *value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Registers backed by ordinary memory stand in for the window.
    fn bus(backing: &[ReadWrite<u32>]) -> ConfigBus<'_> {
        ConfigBus { regs: backing }
    }

    fn backing(n: usize) -> Vec<ReadWrite<u32>> {
        // SAFETY: ReadWrite<u32> is a plain u32 cell, so zeroed is valid.
        (0..n).map(|_| unsafe { std::mem::zeroed() }).collect()
    }

    #[test]
    fn test_read_write() {
        let regs = backing(8);
        let bus = bus(&regs);
        bus.write(CfgRegister::AxisAddr, 1);
        bus.write(3usize, 0xdead_beef);
        assert_eq!(bus.read(CfgRegister::AxisAddr), 1);
        assert_eq!(bus.read(CfgRegister::Hp0SrcCnt), 0xdead_beef);
        assert_eq!(bus.read(2usize), 0);
    }

    #[test]
    fn test_write_array_targets_one_register() {
        let regs = backing(8);
        let bus = bus(&regs);
        bus.write_array(CfgRegister::Hp0DstData, &[1, 2, 3]);
        assert_eq!(bus.read(CfgRegister::Hp0DstData), 3);
        assert_eq!(bus.read(CfgRegister::Hp0SrcData), 0);
        assert_eq!(bus.read(CfgRegister::Hp0SrcCnt), 0);
    }

    #[test]
    fn test_write_sequence() {
        let regs = backing(8);
        let bus = bus(&regs);
        bus.write_sequence(&[0, 1, 1, 6], &[2, 0x1000, 64, 9]);
        assert_eq!(bus.read(0usize), 2);
        assert_eq!(bus.read(1usize), 64);
        assert_eq!(bus.read(6usize), 9);
    }

    #[test]
    #[should_panic(expected = "differ in length")]
    fn test_write_sequence_length_mismatch() {
        let regs = backing(8);
        bus(&regs).write_sequence(&[0, 1], &[1]);
    }

    #[test]
    #[should_panic(expected = "outside the 8 register control window")]
    fn test_out_of_range_register() {
        let regs = backing(8);
        bus(&regs).read(8usize);
    }

    #[test]
    fn test_poll_ready() {
        let regs = backing(8);
        let bus = bus(&regs);
        bus.write(CfgRegister::Hp0SrcCnt, 100);
        assert_eq!(bus.poll(CfgRegister::Hp0SrcCnt, 100, None).unwrap(), 100);
        assert_eq!(
            bus.poll(CfgRegister::Hp0SrcCnt, 50, Some(Duration::ZERO))
                .unwrap(),
            100
        );
    }

    #[test]
    fn test_poll_timeout() {
        let regs = backing(8);
        let bus = bus(&regs);
        bus.write(CfgRegister::Hp0DstCnt, 3);
        let err = bus
            .poll(CfgRegister::Hp0DstCnt, 4, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(
            err,
            AxisError::PollTimeout {
                addr: 2,
                threshold: 4,
                last: 3,
                ..
            }
        ));
    }
}
