// Licensed under the Apache-2.0 license

use crate::arena::{DmaArena, DmaBuffer};
use crate::cfg_bus::{CfgRegister, ConfigBus};
use crate::config::{host_page_size, DeviceConfig};
use crate::error::{AxisError, AxisResult};
use crate::mapper::{self, ControlRegion};
use crate::translate::{self, Direction};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zerocopy::{FromBytes, IntoBytes};

/// An open device: both windows plus the arena over the DMA window.
struct Session {
    path: PathBuf,
    control: ControlRegion,
    arena: DmaArena,
}

impl Session {
    /// Unmap both windows. The DMA window is unmapped even when the control
    /// window fails to.
    fn teardown(self) -> AxisResult<()> {
        let Session {
            path,
            control,
            arena,
        } = self;
        let control_result = control.unmap();
        let dma_result = arena.into_region().unmap();
        for err in [&control_result, &dma_result].into_iter().flat_map(|r| r.as_ref().err()) {
            error!("{}: {err}", path.display());
        }
        control_result.and(dma_result)
    }
}

/// Userspace handle on an AXI-Stream engine behind a UIO device.
///
/// The handle starts closed. [`AxisDevice::init`] maps the control and DMA
/// windows; [`AxisDevice::exit`] (or dropping the handle) unmaps them. Register
/// access, allocation and [`AxisDevice::axis_memory_addr`] require an open
/// device and panic otherwise. The pure computations
/// [`AxisDevice::alloc_size`], [`AxisDevice::alloc_length`],
/// [`AxisDevice::axis_stream_length`] and [`AxisDevice::axis_port_id`] depend
/// only on their arguments and the host page size, so they also work on a
/// closed handle.
///
/// The device is meant to be driven from one thread. Concurrent use of the
/// same UIO device from several handles or processes must be serialized by
/// the caller.
///
/// ```no_run
/// use axis_uio::{AxisDevice, CfgRegister, DeviceConfig, Direction};
/// use std::path::Path;
///
/// let mut dev = AxisDevice::new(DeviceConfig::default());
/// dev.init(Path::new("/dev/axis"))?;
/// let mut buf = dev.mem_alloc::<u32>(100)?;
/// for (i, v) in buf.iter_mut().enumerate() {
///     *v = 100 + i as u32;
/// }
/// dev.stream_from(&buf, 0);
/// dev.cfg_read(CfgRegister::Hp0SrcData);
/// let first = dev.cfg_read(CfgRegister::Hp0SrcData);
/// drop(buf);
/// dev.exit()?;
/// # Ok::<(), axis_uio::AxisError>(())
/// ```
pub struct AxisDevice {
    config: DeviceConfig,
    page_size: usize,
    session: Option<Session>,
}

impl AxisDevice {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            page_size: host_page_size(),
            session: None,
        }
    }

    /// Create a handle and open `path` in one step.
    pub fn open(path: &Path, config: DeviceConfig) -> AxisResult<Self> {
        let mut dev = Self::new(config);
        dev.init(path)?;
        Ok(dev)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Map the windows of the device at `path`. On failure the handle stays
    /// closed.
    pub fn init(&mut self, path: &Path) -> AxisResult<()> {
        if self.session.is_some() {
            return Err(AxisError::AlreadyOpen);
        }
        self.config.validate(self.page_size)?;

        let (control, dma) = mapper::open(path, &self.config, self.page_size)?;
        info!(
            "opened {}: {} registers, {:#x} byte DMA window at {:#x}",
            path.display(),
            control.register_nb(),
            dma.len(),
            dma.base_address()
        );
        self.session = Some(Session {
            path: path.to_path_buf(),
            control,
            arena: DmaArena::new(dma, self.page_size),
        });
        Ok(())
    }

    /// Unmap both windows. Closing a closed device does nothing.
    ///
    /// Both unmaps are attempted; the first failure is returned.
    pub fn exit(&mut self) -> AxisResult<()> {
        match self.session.take() {
            Some(session) => {
                info!("closing {}", session.path.display());
                session.teardown()
            }
            None => Ok(()),
        }
    }

    fn session(&self) -> &Session {
        match &self.session {
            Some(session) => session,
            None => panic!("AXIS device used while closed"),
        }
    }

    /// Register accessor for the open control window.
    pub fn cfg(&self) -> ConfigBus<'_> {
        ConfigBus::new(&self.session().control)
    }

    /// Allocator over the open DMA window.
    pub fn arena(&self) -> &DmaArena {
        &self.session().arena
    }

    /// Physical base address of the open DMA window.
    pub fn base_address(&self) -> u32 {
        self.arena().region().base_address()
    }

    pub fn cfg_write(&self, addr: impl Into<usize>, data: u32) {
        self.cfg().write(addr, data)
    }

    pub fn cfg_read(&self, addr: impl Into<usize>) -> u32 {
        self.cfg().read(addr)
    }

    pub fn cfg_poll(
        &self,
        addr: impl Into<usize>,
        threshold: u32,
        timeout: Option<Duration>,
    ) -> AxisResult<u32> {
        self.cfg().poll(addr, threshold, timeout)
    }

    pub fn cfg_write_array(&self, addr: impl Into<usize>, data: &[u32]) {
        self.cfg().write_array(addr, data)
    }

    pub fn cfg_write_sequence(&self, addrs: &[usize], data: &[u32]) {
        self.cfg().write_sequence(addrs, data)
    }

    pub fn mem_alloc<T: FromBytes + IntoBytes>(&self, length: usize) -> AxisResult<DmaBuffer<'_, T>> {
        self.arena().alloc(length)
    }

    pub fn mem_alloc_raw(&self, length: usize, byte_nb: usize) -> AxisResult<DmaBuffer<'_, u8>> {
        self.arena().alloc_raw(length, byte_nb)
    }

    /// Page-rounded size of a hypothetical allocation. Does not need an open
    /// device.
    pub fn alloc_size(&self, length: usize, byte_nb: usize) -> usize {
        translate::alloc_size(length, byte_nb, self.page_size)
    }

    /// Usable element count of a hypothetical allocation. Does not need an
    /// open device.
    pub fn alloc_length(&self, length: usize, byte_nb: usize) -> usize {
        translate::alloc_length(length, byte_nb, self.page_size)
    }

    /// Physical address of `buffer` for the control bus.
    pub fn axis_memory_addr<T>(&self, buffer: &DmaBuffer<'_, T>) -> u32 {
        translate::physical_address(self.arena().region(), buffer)
    }

    /// Stream length in bus words. Does not need an open device.
    pub fn axis_stream_length(&self, length: usize, byte_nb: usize) -> u32 {
        translate::stream_word_count(length, byte_nb)
    }

    /// Control bus port identifier. Does not need an open device.
    pub fn axis_port_id(&self, index: usize, direction: Direction) -> u32 {
        translate::port_id(index, direction)
    }

    fn program_transfer<T>(&self, buffer: &DmaBuffer<'_, T>, port: u32) {
        let cfg = self.cfg();
        let byte_nb = std::mem::size_of::<T>().max(1);
        cfg.write(CfgRegister::AxisAddr, port);
        cfg.write(CfgRegister::AxisData, self.axis_memory_addr(buffer));
        cfg.write(
            CfgRegister::AxisData,
            translate::stream_word_count(buffer.len(), byte_nb),
        );
    }

    /// Point source port `index` at `buffer`: the engine streams the buffer
    /// out of memory.
    pub fn stream_from<T>(&self, buffer: &DmaBuffer<'_, T>, index: usize) {
        self.program_transfer(buffer, translate::port_id(index, Direction::Src));
    }

    /// Point destination port `index` at `buffer`: the engine streams into
    /// memory.
    pub fn stream_to<T>(&self, buffer: &DmaBuffer<'_, T>, index: usize) {
        self.program_transfer(buffer, translate::port_id(index, Direction::Dst));
    }
}

impl Drop for AxisDevice {
    fn drop(&mut self) {
        // Failures are already logged by teardown.
        let _ = self.exit();
    }
}

impl std::fmt::Debug for AxisDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("AxisDevice");
        s.field("config", &self.config).field("page_size", &self.page_size);
        match &self.session {
            Some(session) => s
                .field("path", &session.path)
                .field("arena", &session.arena),
            None => s.field("open", &false),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::DmaRegion;
    use std::io;

    #[test]
    fn test_closed_device() {
        let mut dev = AxisDevice::new(DeviceConfig::default());
        assert!(!dev.is_open());
        dev.exit().unwrap();
        dev.exit().unwrap();
        assert_eq!(dev.alloc_length(100, 4) * 4, dev.alloc_size(100, 4));
        assert_eq!(dev.axis_stream_length(100, 4), 100);
        assert_eq!(dev.axis_port_id(1, Direction::Dst), 4);
    }

    #[test]
    #[should_panic(expected = "used while closed")]
    fn test_register_access_while_closed() {
        let dev = AxisDevice::new(DeviceConfig::default());
        dev.cfg_read(0usize);
    }

    #[test]
    #[should_panic(expected = "used while closed")]
    fn test_alloc_while_closed() {
        let dev = AxisDevice::new(DeviceConfig::default());
        let _ = dev.mem_alloc::<u32>(1);
    }

    #[test]
    fn test_teardown_releases_dma_window_when_control_unmap_fails() {
        let page = host_page_size();
        let dma_len = 37 * page;
        let dma = DmaRegion::anonymous(dma_len, 0x1000_0000).unwrap();
        let dma_ptr = dma.as_ptr() as *mut libc::c_void;
        let session = Session {
            path: PathBuf::from("/dev/axis"),
            control: ControlRegion::unaligned(page).unwrap(),
            arena: DmaArena::new(dma, page),
        };

        let err = session.teardown().unwrap_err();
        assert!(matches!(err, AxisError::Unmap { window: "register", .. }));

        // msync fails with ENOMEM on a range that is no longer mapped.
        // SAFETY: msync only inspects the address range.
        let rc = unsafe { libc::msync(dma_ptr, dma_len, libc::MS_ASYNC) };
        assert_eq!(rc, -1);
        assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::ENOMEM));
    }

    #[test]
    fn test_teardown_of_healthy_session() {
        let page = host_page_size();
        let session = Session {
            path: PathBuf::from("/dev/axis"),
            control: ControlRegion::anonymous(page, 32).unwrap(),
            arena: DmaArena::new(DmaRegion::anonymous(4 * page, 0).unwrap(), page),
        };
        session.teardown().unwrap();
    }

    #[test]
    fn test_init_missing_device_stays_closed() {
        let mut dev = AxisDevice::new(DeviceConfig::default());
        let err = dev.init(Path::new("/nonexistent/axis")).unwrap_err();
        assert!(matches!(err, AxisError::DeviceOpen { .. }));
        assert!(!dev.is_open());
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let mut dev = AxisDevice::new(DeviceConfig::default().with_mem_size(1));
        assert!(matches!(
            dev.init(Path::new("/nonexistent/axis")),
            Err(AxisError::Config(_))
        ));
    }
}
