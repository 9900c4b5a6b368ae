//! Device Cache Control (C4).
//!
//! Optional: disables, and later re-enables, a block device's write cache,
//! with reference counting across devices sharing one table. Errors here
//! are reported but never fatal, per spec.md §4.4.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    refcount: u32,
    cache_was_enabled: bool,
}

/// Single-owner, process-global-equivalent table keyed by device path; the
/// Rust replacement for the original's global cache-ioctl table (spec.md
/// §9), owned explicitly by the Dispatcher rather than living in a static.
pub struct CacheTable {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

// BLKFLSBUF (flush buffer cache) and a disable/enable write-cache pair
// modeled on `HDIO_GET_WCACHE`/`HDIO_SET_WCACHE` as used by hardware
// utilities; both live behind `nix::ioctl_*!` wrappers, as `fuse_pure.rs`
// wraps its own platform ioctls.
nix::ioctl_none!(blk_flush_buffers, 0x12, 97);
nix::ioctl_read!(hdio_get_wcache, 0x03, 0x0e, u8);
nix::ioctl_write_ptr!(hdio_set_wcache, 0x03, 0x0e, u8);

impl CacheTable {
    pub fn new() -> Self {
        CacheTable {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Opens `dev`, flushes its cache, disables write-caching, and bumps
    /// the device's reference count. Non-fatal on failure.
    pub fn disable(&self, dev: &Path) {
        let mut entries = self.entries.lock().expect("cache table mutex poisoned");
        if let Some(entry) = entries.get_mut(dev) {
            entry.refcount += 1;
            return;
        }

        let cache_was_enabled = match OpenOptions::new().read(true).write(true).open(dev) {
            Ok(file) => {
                let fd = file.as_raw_fd();
                let mut was_on: u8 = 1;
                unsafe {
                    if hdio_get_wcache(fd, &mut was_on).is_err() {
                        log::warn!("could not query write cache state for {}", dev.display());
                    }
                    if blk_flush_buffers(fd).is_err() {
                        log::warn!("could not flush cache for {}", dev.display());
                    }
                    let off: u8 = 0;
                    if hdio_set_wcache(fd, &off).is_err() {
                        log::warn!("could not disable write cache for {}", dev.display());
                    }
                }
                was_on != 0
            }
            Err(e) => {
                log::warn!("could not open {} for cache control: {}", dev.display(), e);
                false
            }
        };

        entries.insert(
            dev.to_path_buf(),
            CacheEntry {
                refcount: 1,
                cache_was_enabled,
            },
        );
    }

    /// Decrements the reference count and, once it reaches zero, restores
    /// the device's original write-cache state if it was on.
    pub fn enable(&self, dev: &Path) {
        let mut entries = self.entries.lock().expect("cache table mutex poisoned");
        let Some(entry) = entries.get_mut(dev) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }
        let cache_was_enabled = entry.cache_was_enabled;
        entries.remove(dev);

        if !cache_was_enabled {
            return;
        }
        match OpenOptions::new().read(true).write(true).open(dev) {
            Ok(file) => {
                let fd = file.as_raw_fd();
                let on: u8 = 1;
                unsafe {
                    if hdio_set_wcache(fd, &on).is_err() {
                        log::warn!("could not re-enable write cache for {}", dev.display());
                    }
                }
            }
            Err(e) => {
                log::warn!("could not reopen {} to restore cache: {}", dev.display(), e);
            }
        }
    }
}

impl Default for CacheTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_tracks_nested_disable_enable() {
        let table = CacheTable::new();
        // Using a path that cannot be opened keeps this test hermetic; the
        // refcounting logic is exercised regardless of ioctl success.
        let dev = Path::new("/nonexistent/secwipe-test-device");
        table.disable(dev);
        table.disable(dev);
        {
            let entries = table.entries.lock().unwrap();
            assert_eq!(entries.get(dev).unwrap().refcount, 2);
        }
        table.enable(dev);
        {
            let entries = table.entries.lock().unwrap();
            assert_eq!(entries.get(dev).unwrap().refcount, 1);
        }
        table.enable(dev);
        {
            let entries = table.entries.lock().unwrap();
            assert!(entries.get(dev).is_none());
        }
    }
}
