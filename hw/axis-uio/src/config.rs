// Licensed under the Apache-2.0 license

//! Deployment configuration for an AXIS UIO device.
//!
//! The control window and the DMA window are two segments of the same device
//! file: the control window sits at mapping offset zero and the DMA window one
//! host page further. Only the sizes vary between deployments, so they live in
//! [`DeviceConfig`] together with the sysfs location of the DMA base address.
//!
//! # Example
//!
//! ```
//! use axis_uio::config::{DeviceConfig, MEM_SIZE_126M};
//!
//! let config = DeviceConfig::from_toml_str("mem_size = 132120576").unwrap();
//! assert_eq!(config.mem_size, MEM_SIZE_126M);
//! assert_eq!(config.register_nb, 32);
//! ```

use crate::error::{AxisError, AxisResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Number of 32-bit registers in the control window.
pub const REGISTER_NB: usize = 32;

/// Number of AXI-Stream ports, each with a source and a destination side.
pub const AXIS_NB: usize = 4;

/// Width of a control bus transfer in bytes.
pub const BUS_WORD_SIZE: usize = 4;

/// DMA window size of the 63 MiB deployment.
pub const MEM_SIZE_63M: usize = 63 * 1024 * 1024;

/// DMA window size of the 126 MiB deployment.
pub const MEM_SIZE_126M: usize = 126 * 1024 * 1024;

/// Mapping offset of the control window, in host pages.
pub const CONTROL_MAP_PAGE: usize = 0;

/// Mapping offset of the DMA window, in host pages.
pub const DMA_MAP_PAGE: usize = 1;

pub const DEFAULT_SYSFS_CLASS_ROOT: &str = "/sys/class/uio";
pub const DEFAULT_DMA_MAP: &str = "map1";

/// Sizes and sysfs locations for one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Number of registers exposed by the control window.
    pub register_nb: usize,

    /// Size of the DMA window in bytes. Must be a multiple of the host page size.
    pub mem_size: usize,

    /// Directory holding one entry per UIO device (`/sys/class/uio`).
    pub sysfs_class_root: PathBuf,

    /// UIO map that describes the DMA window.
    pub dma_map: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            register_nb: REGISTER_NB,
            mem_size: MEM_SIZE_63M,
            sysfs_class_root: PathBuf::from(DEFAULT_SYSFS_CLASS_ROOT),
            dma_map: DEFAULT_DMA_MAP.to_string(),
        }
    }
}

impl DeviceConfig {
    /// Parse a configuration from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> AxisResult<Self> {
        toml::from_str(contents).map_err(|e| AxisError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> AxisResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AxisError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Render the configuration in the format [`DeviceConfig::from_toml_str`]
    /// accepts.
    pub fn to_toml_string(&self) -> AxisResult<String> {
        toml::to_string_pretty(self).map_err(|e| AxisError::Config(e.to_string()))
    }

    pub fn with_mem_size(mut self, mem_size: usize) -> Self {
        self.mem_size = mem_size;
        self
    }

    pub fn with_sysfs_class_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_class_root = root.into();
        self
    }

    /// Length of the control window in bytes, or `None` if it overflows.
    pub fn register_window_len(&self) -> Option<usize> {
        self.register_nb.checked_mul(BUS_WORD_SIZE)
    }

    /// Byte offset of the control window within the device file.
    pub fn control_map_offset(&self, page_size: usize) -> usize {
        CONTROL_MAP_PAGE * page_size
    }

    /// Byte offset of the DMA window within the device file.
    pub fn dma_map_offset(&self, page_size: usize) -> usize {
        DMA_MAP_PAGE * page_size
    }

    /// Sysfs attribute holding the physical base address of the DMA window
    /// for the device named `device_name`.
    pub fn base_address_attr(&self, device_name: &str) -> PathBuf {
        self.sysfs_class_root
            .join(device_name)
            .join("maps")
            .join(&self.dma_map)
            .join("addr")
    }

    /// Check the configuration against the host page size.
    pub fn validate(&self, page_size: usize) -> AxisResult<()> {
        if self.register_nb == 0 {
            return Err(AxisError::Config("register_nb must be non-zero".into()));
        }
        let fits = self.register_nb <= page_size / BUS_WORD_SIZE
            && self.register_window_len().is_some_and(|len| len <= page_size);
        if !fits {
            return Err(AxisError::Config(format!(
                "{} registers do not fit in one {page_size:#x} byte page",
                self.register_nb
            )));
        }
        if self.mem_size == 0 || self.mem_size % page_size != 0 {
            return Err(AxisError::Config(format!(
                "mem_size {:#x} is not a non-zero multiple of the page size {page_size:#x}",
                self.mem_size
            )));
        }
        if self.dma_map.is_empty() {
            return Err(AxisError::Config("dma_map must name a UIO map".into()));
        }
        Ok(())
    }
}

/// Page size of the host, as used for mapping offsets and arena rounding.
pub fn host_page_size() -> usize {
    // SAFETY: sysconf has no memory safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        warn!("sysconf(_SC_PAGESIZE) failed, assuming 4 KiB pages");
        return 4096;
    }
    size as usize
}
