// Licensed under the Apache-2.0 license

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the AXIS device interface.
///
/// Caller bugs (zero-sized allocations, out of range register or port
/// indices, buffers from another session, operations on a closed device)
/// are not represented here: they panic.
#[derive(Error, Debug)]
pub enum AxisError {
    #[error("failed to open device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map {len:#x} byte register window of {path}: {source}")]
    RegisterMap {
        path: PathBuf,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map {len:#x} byte DMA window of {path} at offset {offset:#x}: {source}")]
    DmaMap {
        path: PathBuf,
        offset: usize,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve DMA base address via {path}: {reason}")]
    BaseAddressResolution { path: PathBuf, reason: String },

    #[error("DMA arena exhausted: requested {requested:#x} bytes, {remaining:#x} of {capacity:#x} left")]
    ArenaExhausted {
        requested: usize,
        remaining: usize,
        capacity: usize,
    },

    #[error("failed to unmap {window} window: {source}")]
    Unmap {
        window: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("register {addr} stayed below {threshold:#x} for {timeout:?} (last read {last:#x})")]
    PollTimeout {
        addr: usize,
        threshold: u32,
        last: u32,
        timeout: Duration,
    },

    #[error("device is already open")]
    AlreadyOpen,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for AXIS device operations
pub type AxisResult<T> = std::result::Result<T, AxisError>;
