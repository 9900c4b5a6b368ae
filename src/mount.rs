//! Mount Guard (C3).
//!
//! Grounded on `original_source/src/wfs_mount_check.c` (the `/etc/mtab` and
//! `/proc/mounts` line formats) and, for the scanning style, on
//! `examples/cberner-fuser/src/mnt/fuse_direct.rs::should_auto_unmount`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{WfsError, WfsResult};

/// Result of checking whether a device is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    MountedRo,
    MountedRw,
}

const MTAB_PATHS: &[&str] = &["/etc/mtab", "/proc/mounts"];

/// Checks whether `dev_path` is mounted, and if so, whether read-write.
/// Consults `/etc/mtab` first, falling back to `/proc/mounts`, matching the
/// original's `wfs_get_mnt_point_getmntent`/`wfs_get_mnt_point_mounts`
/// fallback order. Loop devices are resolved to their backing file first.
pub fn check_mount(dev_path: &Path) -> WfsResult<MountState> {
    let resolved = resolve_loop_backing_file(dev_path).unwrap_or_else(|| dev_path.to_path_buf());

    for candidate in MTAB_PATHS {
        match scan_mount_table(Path::new(candidate), &resolved) {
            Ok(Some(state)) => return Ok(state),
            Ok(None) => continue,
            Err(e) => {
                log::debug!("could not consult {}: {}", candidate, e);
                continue;
            }
        }
    }
    Ok(MountState::Unmounted)
}

/// Scans one mount-table-formatted file (`/etc/mtab` or `/proc/mounts`
/// share the same `device mountpoint fstype options freq passno` format)
/// for a line naming `dev_path`.
fn scan_mount_table(table_path: &Path, dev_path: &Path) -> WfsResult<Option<MountState>> {
    let file = File::open(table_path).map_err(WfsError::MntChk)?;
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line.map_err(WfsError::MntChk)?;
        let mut fields = line.split_whitespace();
        let Some(fsname) = fields.next() else {
            continue;
        };
        let Some(_mnt_dir) = fields.next() else {
            continue;
        };
        let Some(_fstype) = fields.next() else {
            continue;
        };
        let Some(options) = fields.next() else {
            continue;
        };

        if Path::new(fsname) != dev_path {
            continue;
        }

        let is_rw = options.split(',').any(|o| o == "rw");
        return Ok(Some(if is_rw {
            MountState::MountedRw
        } else {
            MountState::MountedRo
        }));
    }
    Ok(None)
}

/// Resolves a loop device to its backing file via `LOOP_GET_STATUS64`, so a
/// mounted loop-backed image is detected correctly even though the mount
/// table names `/dev/loopN` rather than the image path.
fn resolve_loop_backing_file(dev_path: &Path) -> Option<PathBuf> {
    let meta = std::fs::metadata(dev_path).ok()?;
    if !is_loop_device(&meta) {
        return None;
    }

    let file = File::open(dev_path).ok()?;
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();

    #[repr(C)]
    struct LoopInfo64 {
        lo_device: u64,
        lo_inode: u64,
        lo_rdevice: u64,
        lo_offset: u64,
        lo_sizelimit: u64,
        lo_number: u32,
        lo_encrypt_type: u32,
        lo_encrypt_key_size: u32,
        lo_flags: u32,
        lo_file_name: [u8; 64],
        lo_crypt_name: [u8; 64],
        lo_encrypt_key: [u8; 32],
        lo_init: [u64; 2],
    }

    nix::ioctl_read!(loop_get_status64, 0x4C, 0x12, LoopInfo64);

    let mut info = LoopInfo64 {
        lo_device: 0,
        lo_inode: 0,
        lo_rdevice: 0,
        lo_offset: 0,
        lo_sizelimit: 0,
        lo_number: 0,
        lo_encrypt_type: 0,
        lo_encrypt_key_size: 0,
        lo_flags: 0,
        lo_file_name: [0; 64],
        lo_crypt_name: [0; 64],
        lo_encrypt_key: [0; 32],
        lo_init: [0; 2],
    };
    // Safety: `info` is a plain-old-data struct sized to match the kernel's
    // `struct loop_info64`; the ioctl either fills it or returns an error.
    unsafe {
        loop_get_status64(fd, &mut info).ok()?;
    }

    let nul = info
        .lo_file_name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(info.lo_file_name.len());
    if nul == 0 {
        return None;
    }
    let name = std::str::from_utf8(&info.lo_file_name[..nul]).ok()?;
    Some(PathBuf::from(name))
}

fn is_loop_device(meta: &std::fs::Metadata) -> bool {
    const LOOP_MAJOR: u64 = 7;
    nix::sys::stat::SFlag::from_bits_truncate(meta.mode()).contains(nix::sys::stat::SFlag::S_IFBLK)
        && (meta.rdev() >> 8) & 0xff == LOOP_MAJOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_mtab(lines: &[&str]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{}", l).unwrap();
        }
        f
    }

    #[test]
    fn detects_read_write_mount() {
        let mtab = write_mtab(&[
            "/dev/sda1 / ext4 rw,relatime 0 0",
            "/dev/sdb1 /mnt/data xfs ro,relatime 0 0",
        ]);
        assert_eq!(
            scan_mount_table(mtab.path(), Path::new("/dev/sda1")).unwrap(),
            Some(MountState::MountedRw)
        );
        assert_eq!(
            scan_mount_table(mtab.path(), Path::new("/dev/sdb1")).unwrap(),
            Some(MountState::MountedRo)
        );
    }

    #[test]
    fn unlisted_device_is_unmounted() {
        let mtab = write_mtab(&["/dev/sda1 / ext4 rw,relatime 0 0"]);
        assert_eq!(
            scan_mount_table(mtab.path(), Path::new("/dev/sdz9")).unwrap(),
            None
        );
    }
}
