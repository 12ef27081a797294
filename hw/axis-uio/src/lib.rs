// Licensed under the Apache-2.0 license

//! Userspace interface to an FPGA AXI-Stream DMA engine exposed through a
//! UIO device.
//!
//! The driver exposes two mappable segments on one device file: a small
//! window of 32-bit control registers and a large, physically contiguous DMA
//! window. This crate maps both, hands out buffers from the DMA window with
//! a bump allocator, and translates buffers and stream parameters into the
//! address, length and port encodings the control bus expects.
//!
//! [`AxisDevice`] is the entry point; the component modules are public for
//! callers that want to compose them differently.

pub mod arena;
pub mod cfg_bus;
pub mod config;
pub mod device;
pub mod error;
pub mod mapper;
pub mod translate;

pub use arena::{DmaArena, DmaBuffer};
pub use cfg_bus::{CfgRegister, ConfigBus};
pub use config::{host_page_size, DeviceConfig, AXIS_NB, REGISTER_NB};
pub use device::AxisDevice;
pub use error::{AxisError, AxisResult};
pub use mapper::{ControlRegion, DmaRegion, PhysWindow};
pub use translate::Direction;
