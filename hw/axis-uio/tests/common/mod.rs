// Licensed under the Apache-2.0 license

use axis_uio::{host_page_size, DeviceConfig};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tempfile::TempDir;

pub const DMA_BASE: u32 = 0x1b90_0000;
pub const MEM_SIZE: usize = 64 * 1024 * 1024;

/// A stand-in for a UIO device: a sparse regular file holding the control
/// page followed by the DMA window, a `/dev/axis`-style symlink to it, and a
/// sysfs tree publishing the DMA base address.
pub struct FakeUio {
    _dir: TempDir,
    pub dev_path: PathBuf,
    pub alias_path: PathBuf,
    pub config: DeviceConfig,
    pub page_size: usize,
    file: File,
}

impl FakeUio {
    pub fn new() -> Self {
        Self::with_base_address(&format!("{DMA_BASE:#x}\n"))
    }

    pub fn with_base_address(addr: &str) -> Self {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init();

        let dir = tempfile::tempdir().unwrap();
        let page_size = host_page_size();

        let dev_dir = dir.path().join("dev");
        std::fs::create_dir(&dev_dir).unwrap();
        let dev_path = dev_dir.join("uio3");
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&dev_path)
            .unwrap();
        file.set_len((page_size + MEM_SIZE) as u64).unwrap();

        let alias_path = dev_dir.join("axis");
        std::os::unix::fs::symlink(&dev_path, &alias_path).unwrap();

        let sysfs = dir.path().join("sys");
        let map_dir = sysfs.join("uio3").join("maps").join("map1");
        std::fs::create_dir_all(&map_dir).unwrap();
        std::fs::write(map_dir.join("addr"), addr).unwrap();

        let config = DeviceConfig::default()
            .with_mem_size(MEM_SIZE)
            .with_sysfs_class_root(sysfs);

        Self {
            _dir: dir,
            dev_path,
            alias_path,
            config,
            page_size,
            file,
        }
    }

    pub fn sysfs_attr(&self) -> PathBuf {
        self.config.base_address_attr("uio3")
    }

    /// Read a register the way the hardware sees it.
    pub fn register(&self, index: usize) -> u32 {
        let mut bytes = [0u8; 4];
        self.file.read_exact_at(&mut bytes, (index * 4) as u64).unwrap();
        u32::from_ne_bytes(bytes)
    }

    /// Update a register from the hardware side.
    pub fn set_register(&self, index: usize, value: u32) {
        self.file
            .write_all_at(&value.to_ne_bytes(), (index * 4) as u64)
            .unwrap();
    }

    /// Read `count` words of the DMA window starting at byte `offset`.
    pub fn dma_words(&self, offset: usize, count: usize) -> Vec<u32> {
        let mut bytes = vec![0u8; count * 4];
        self.file
            .read_exact_at(&mut bytes, (self.page_size + offset) as u64)
            .unwrap();
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}
