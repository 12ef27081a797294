/*++

Licensed under the Apache-2.0 license.

File Name:

    mapper.rs

Abstract:

    Mapping of the two windows a UIO device exposes: the control register
    window at mapping offset zero and the DMA window one page further. The
    physical base of the DMA window is not chosen by us; the driver publishes
    it under /sys/class/uio/<device>/maps/map1/addr.

--*/

use crate::config::DeviceConfig;
use crate::error::{AxisError, AxisResult};
use log::{debug, error};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem::ManuallyDrop;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// An owned shared mapping. Unmapped exactly once, either through
/// [`MappedWindow::unmap`] or on drop.
pub(crate) struct MappedWindow {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedWindow {
    fn map(file: &File, offset: usize, len: usize) -> io::Result<Self> {
        // SAFETY: a fresh shared mapping; the kernel picks the address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    #[cfg(test)]
    pub(crate) fn anonymous(len: usize) -> io::Result<Self> {
        // SAFETY: anonymous mapping, no file involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Unmap now and report the result. The window is consumed either way,
    /// so a failed unmap is never retried.
    pub(crate) fn unmap(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        // SAFETY: ptr/len describe a live mapping owned by `this`, which is
        // never used again.
        let rc = unsafe { libc::munmap(this.ptr.as_ptr() as *mut libc::c_void, this.len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        // SAFETY: see `unmap`.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            error!(
                "munmap of {:#x} bytes at {:p} failed: {}",
                self.len,
                self.ptr,
                io::Error::last_os_error()
            );
        }
    }
}

/// The control register window.
pub struct ControlRegion {
    window: MappedWindow,
    register_nb: usize,
}

impl ControlRegion {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.window.as_ptr()
    }

    /// Number of 32-bit registers in the window.
    pub fn register_nb(&self) -> usize {
        self.register_nb
    }

    pub(crate) fn unmap(self) -> AxisResult<()> {
        self.window.unmap().map_err(|source| AxisError::Unmap {
            window: "register",
            source,
        })
    }
}

#[cfg(test)]
impl ControlRegion {
    pub(crate) fn anonymous(len: usize, register_nb: usize) -> io::Result<Self> {
        assert!(register_nb * 4 <= len);
        Ok(Self {
            window: MappedWindow::anonymous(len)?,
            register_nb,
        })
    }

    /// A region whose unmap fails: it starts one byte into an anonymous page,
    /// which `munmap` rejects. The page itself is leaked.
    pub(crate) fn unaligned(page_size: usize) -> io::Result<Self> {
        let page = ManuallyDrop::new(MappedWindow::anonymous(page_size)?);
        // SAFETY: one byte into the page just mapped.
        let ptr = unsafe { NonNull::new_unchecked(page.as_ptr().add(1)) };
        Ok(Self {
            window: MappedWindow {
                ptr,
                len: page_size - 1,
            },
            register_nb: 1,
        })
    }
}

/// The DMA window together with its physical base address.
pub struct DmaRegion {
    window: MappedWindow,
    base_address: u32,
}

impl DmaRegion {
    #[cfg(test)]
    pub(crate) fn anonymous(len: usize, base_address: u32) -> io::Result<Self> {
        Ok(Self {
            window: MappedWindow::anonymous(len)?,
            base_address,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.window.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.window.as_ptr()
    }

    /// Size of the window in bytes.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.len() == 0
    }

    /// Physical address of the first byte of the window.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    pub(crate) fn unmap(self) -> AxisResult<()> {
        self.window.unmap().map_err(|source| AxisError::Unmap {
            window: "DMA",
            source,
        })
    }
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu_ptr", &self.as_ptr())
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .field("len", &format_args!("{:#x}", self.len()))
            .finish()
    }
}

/// Open `path` and map both windows described by `config`.
pub fn open(
    path: &Path,
    config: &DeviceConfig,
    page_size: usize,
) -> AxisResult<(ControlRegion, DmaRegion)> {
    // The register count bounds every safe register access.
    config.validate(page_size)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| AxisError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        })?;

    let register_len = config
        .register_window_len()
        .ok_or_else(|| AxisError::Config("register window length overflows".into()))?;
    let window = MappedWindow::map(&file, config.control_map_offset(page_size), register_len)
        .map_err(|source| AxisError::RegisterMap {
            path: path.to_path_buf(),
            len: register_len,
            source,
        })?;
    debug!("mapped {register_len:#x} byte register window at {:p}", window.ptr);
    let control = ControlRegion {
        window,
        register_nb: config.register_nb,
    };

    let dma_offset = config.dma_map_offset(page_size);
    let window = MappedWindow::map(&file, dma_offset, config.mem_size).map_err(|source| {
        AxisError::DmaMap {
            path: path.to_path_buf(),
            offset: dma_offset,
            len: config.mem_size,
            source,
        }
    })?;
    debug!(
        "mapped {:#x} byte DMA window at {:p}",
        config.mem_size, window.ptr
    );

    // Mappings outlive the descriptor.
    drop(file);

    let base_address = resolve_base_address(path, config)?;
    debug!("DMA window physical base {base_address:#x}");

    Ok((
        control,
        DmaRegion {
            window,
            base_address,
        },
    ))
}

/// Read the physical base address of the DMA window for the device at
/// `path`. Symbolic links (e.g. `/dev/axis -> /dev/uio0`) are followed to
/// find the UIO device name.
pub fn resolve_base_address(path: &Path, config: &DeviceConfig) -> AxisResult<u32> {
    let resolution_error = |at: &Path, reason: String| AxisError::BaseAddressResolution {
        path: at.to_path_buf(),
        reason,
    };

    let canonical = std::fs::canonicalize(path).map_err(|e| resolution_error(path, e.to_string()))?;
    let name = canonical
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| resolution_error(&canonical, "no usable device name".into()))?;

    let attr: PathBuf = config.base_address_attr(name);
    let contents =
        std::fs::read_to_string(&attr).map_err(|e| resolution_error(&attr, e.to_string()))?;
    let base = parse_hex_address(&contents)
        .ok_or_else(|| resolution_error(&attr, format!("invalid address {:?}", contents.trim())))?;

    let end = base
        .checked_add(config.mem_size as u64)
        .filter(|end| *end <= 1u64 << 32)
        .ok_or_else(|| {
            resolution_error(
                &attr,
                format!(
                    "window {base:#x}+{:#x} exceeds the 32-bit bus",
                    config.mem_size
                ),
            )
        })?;
    debug!("{} maps DMA window {base:#x}..{end:#x}", attr.display());
    Ok(base as u32)
}

/// Parse a sysfs hexadecimal address such as `0x1b900000\n`.
pub fn parse_hex_address(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// A window onto an arbitrary physical range of a generic memory device
/// such as `/dev/mem`, with volatile word access.
pub struct PhysWindow {
    window: MappedWindow,
    page_offset: usize,
    len: usize,
    phys_addr: u64,
}

impl PhysWindow {
    /// Map `len` bytes starting at physical address `phys_addr`. The address
    /// does not need to be page aligned.
    pub fn open(path: &Path, phys_addr: u64, len: usize, page_size: usize) -> AxisResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|source| AxisError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;

        let page_offset = (phys_addr % page_size as u64) as usize;
        let map_base = phys_addr - page_offset as u64;
        let window = MappedWindow::map(&file, map_base as usize, len + page_offset).map_err(
            |source| AxisError::DmaMap {
                path: path.to_path_buf(),
                offset: map_base as usize,
                len: len + page_offset,
                source,
            },
        )?;
        debug!(
            "mapped physical range {phys_addr:#x}+{len:#x} of {}",
            path.display()
        );

        Ok(Self {
            window,
            page_offset,
            len,
            phys_addr,
        })
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    /// Number of 32-bit words in the window.
    pub fn word_count(&self) -> usize {
        self.len / 4
    }

    fn word_ptr(&self, index: usize) -> *mut u32 {
        assert!(
            index < self.word_count(),
            "word {index} outside physical window of {} words",
            self.word_count()
        );
        // SAFETY: index is within the mapped range checked above.
        unsafe { self.window.as_ptr().add(self.page_offset + index * 4) as *mut u32 }
    }

    pub fn read32(&self, index: usize) -> u32 {
        // SAFETY: in bounds, and the mapping is live while `self` is.
        unsafe { std::ptr::read_volatile(self.word_ptr(index)) }
    }

    pub fn write32(&self, index: usize, value: u32) {
        // SAFETY: in bounds, and the mapping is live while `self` is.
        unsafe { std::ptr::write_volatile(self.word_ptr(index), value) }
    }

    pub fn close(self) -> AxisResult<()> {
        self.window.unmap().map_err(|source| AxisError::Unmap {
            window: "physical",
            source,
        })
    }
}
