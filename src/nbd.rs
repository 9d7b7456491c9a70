// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    block::{Extent, BLOCK_SIZE},
    cancel::Cancel,
    disk::Disk,
    metrics::Status,
};

/// Export advertises feature flags
pub const FLAG_HAS_FLAGS: u16 = 1 << 0;
/// Export supports flush
pub const FLAG_SEND_FLUSH: u16 = 1 << 2;
/// Export supports trim
pub const FLAG_SEND_TRIM: u16 = 1 << 5;
/// Export supports write-zeroes
pub const FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;

/// Block-granular device surface consumed by the NBD server.
///
/// Offsets and lengths are byte-based but must be multiples of
/// [`BLOCK_SIZE`]; violations and all internal failures map to an errno
/// via [`crate::Error::errno`] (EIO for everything but alignment).
pub trait BlockDevice: Send + Sync {
    /// Device size in bytes.
    fn size(&self) -> u64;

    /// Advertised NBD transmission flags.
    fn flags(&self) -> u16;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()>;

    fn write_at(&self, buf: &[u8], offset: u64) -> crate::Result<()>;

    /// Persist acknowledged writes to stable storage.
    fn flush(&self) -> crate::Result<()>;

    /// Discard a byte range; subsequent reads return zeroes.
    fn trim(&self, offset: u64, len: u64) -> crate::Result<()>;

    /// Write zeroes without transferring payload.
    fn write_zeroes(&self, offset: u64, len: u64) -> crate::Result<()> {
        self.trim(offset, len)
    }
}

/// Adapts a [`Disk`] to the [`BlockDevice`] surface.
pub struct NbdDevice {
    disk: Disk,
    cancel: Cancel,
}

impl NbdDevice {
    #[must_use]
    pub fn new(disk: Disk) -> Self {
        Self {
            disk,
            cancel: Cancel::new(),
        }
    }

    /// Token cancelling every in-flight request of this device.
    #[must_use]
    pub fn cancel_token(&self) -> Cancel {
        self.cancel.clone()
    }

    fn to_extent(&self, offset: u64, len: usize) -> crate::Result<Extent> {
        if offset % BLOCK_SIZE as u64 != 0 || len % BLOCK_SIZE != 0 || len == 0 {
            return Err(crate::Error::Unaligned);
        }

        let blocks = u32::try_from(len / BLOCK_SIZE).map_err(|_| crate::Error::Unaligned)?;
        Ok(Extent::new(offset / BLOCK_SIZE as u64, blocks))
    }
}

impl BlockDevice for NbdDevice {
    fn size(&self) -> u64 {
        self.disk.size()
    }

    fn flags(&self) -> u16 {
        FLAG_HAS_FLAGS | FLAG_SEND_FLUSH | FLAG_SEND_TRIM | FLAG_SEND_WRITE_ZEROES
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        let extent = self.to_extent(offset, buf.len())?;
        let data = self.disk.read_extent(extent, &self.cancel)?;

        buf.copy_from_slice(&data.data);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> crate::Result<()> {
        let extent = self.to_extent(offset, buf.len())?;
        self.disk.write_extent(extent, buf, &self.cancel)
    }

    fn flush(&self) -> crate::Result<()> {
        self.disk.sync_write_cache(&self.cancel)
    }

    fn trim(&self, offset: u64, len: u64) -> crate::Result<()> {
        let extent = self.to_extent(offset, usize::try_from(len).map_err(|_| crate::Error::Unaligned)?)?;
        self.disk.zero_blocks(extent, &self.cancel)
    }
}

/// Thin management surface exposed over RPC by the host process.
pub struct DiskManagement {
    disk: Disk,
}

impl DiskManagement {
    #[must_use]
    pub fn new(disk: Disk) -> Self {
        Self { disk }
    }

    /// Current I/O counters.
    #[must_use]
    pub fn status(&self) -> Status {
        self.disk.status()
    }

    /// Starts the final close in the background and returns immediately,
    /// so the caller is not blocked on the exiting process.
    pub fn unmount(&self) -> std::thread::JoinHandle<crate::Result<()>> {
        let disk = self.disk.clone();

        std::thread::Builder::new()
            .name(String::from("lsvd-unmount"))
            .spawn(move || {
                let cancel = Cancel::new();
                let result = disk.close(&cancel);

                if let Err(e) = &result {
                    log::error!("unmount close failed: {e}");
                }
                result
            })
            .expect("should spawn thread")
    }
}
