//! Filesystem Backend Contract (§4.6) and the `FsHandle` that owns one
//! backend instance for the lifetime of one device's processing.

pub mod ext234;
pub mod fat;
pub mod hfsplus;
pub mod jfs;
pub mod minixfs;
pub mod ntfs;
pub mod ocfs2;
pub mod reiser4;
pub mod reiserv3;
pub mod xfs;

use std::path::{Path, PathBuf};

use crate::config::SessionConfig;
use crate::error::WfsResult;
use crate::progress::SignalBus;

/// Identifies which backend family claimed a device. Probe order in the
/// Dispatcher (§4.7): most-specific magic first, FAT moved ahead of
/// ReiserV3 to avoid the historical FAT-library false positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendId {
    Ext234,
    Ntfs,
    Reiser4,
    Xfs,
    Jfs,
    Fat,
    MinixFs,
    ReiserV3,
    HfsPlus,
    Ocfs2,
}

impl BackendId {
    /// Fixed probe order of spec.md §4.7.
    pub const PROBE_ORDER: [BackendId; 10] = [
        BackendId::Ext234,
        BackendId::Ntfs,
        BackendId::Reiser4,
        BackendId::Xfs,
        BackendId::Jfs,
        BackendId::Fat,
        BackendId::MinixFs,
        BackendId::ReiserV3,
        BackendId::HfsPlus,
        BackendId::Ocfs2,
    ];

    /// True for backends whose native library is known to call `exit()`
    /// or `abort()` on malformed input; the Dispatcher isolates these in a
    /// child process (spec.md §4.7 point 11).
    pub fn needs_process_isolation(self) -> bool {
        matches!(self, BackendId::ReiserV3 | BackendId::MinixFs)
    }
}

/// The Backend Contract every filesystem family implements.
pub trait Backend {
    fn id(&self) -> BackendId;

    /// Overwrites all unrm regions (§3). No-op + 100% progress for
    /// filesystems with no unrm concept (XFS, HFS+).
    fn wipe_unrm(&mut self, signals: &SignalBus) -> WfsResult<()>;

    /// Wipes the slack of every regular file, preserving reported size.
    fn wipe_part(&mut self, signals: &SignalBus) -> WfsResult<()>;

    /// Overwrites every free block/cluster with all configured passes.
    fn wipe_fs(&mut self, signals: &SignalBus) -> WfsResult<()>;

    /// True if the filesystem's own consistency check reports errors.
    fn check_err(&mut self) -> bool;

    /// True if the filesystem is marked dirty (needs fsck).
    fn is_dirty(&mut self) -> bool;

    fn flush(&mut self) -> WfsResult<()>;

    fn close(&mut self) -> WfsResult<()>;
}

/// Bundle owned by the Dispatcher for the lifetime of one device, per
/// spec.md §3's "Filesystem Handle".
pub struct FsHandle {
    pub device_path: PathBuf,
    pub which_fs: BackendId,
    pub backend: Box<dyn Backend>,
    pub config: SessionConfig,
}

impl FsHandle {
    pub fn new(device_path: PathBuf, backend: Box<dyn Backend>, config: SessionConfig) -> Self {
        let which_fs = backend.id();
        FsHandle {
            device_path,
            which_fs,
            backend,
            config,
        }
    }
}

/// One backend's probe function signature: reads the first bytes of the
/// device looking for this family's signature.
pub type ProbeFn = fn(&Path) -> WfsResult<bool>;

/// One backend's open function signature, producing a boxed `Backend` on a
/// successful probe+open.
pub type OpenFn = fn(&Path, &SessionConfig) -> WfsResult<Box<dyn Backend>>;

/// Returns the `(probe, open)` function pair for `id`, used by the
/// Dispatcher to avoid a giant match at every call site.
pub fn probe_and_open(id: BackendId) -> (ProbeFn, OpenFn) {
    match id {
        BackendId::Ext234 => (ext234::probe, ext234::open),
        BackendId::Ntfs => (ntfs::probe, ntfs::open),
        BackendId::Reiser4 => (reiser4::probe, reiser4::open),
        BackendId::Xfs => (xfs::probe, xfs::open),
        BackendId::Jfs => (jfs::probe, jfs::open),
        BackendId::Fat => (fat::probe, fat::open),
        BackendId::MinixFs => (minixfs::probe, minixfs::open),
        BackendId::ReiserV3 => (reiserv3::probe, reiserv3::open),
        BackendId::HfsPlus => (hfsplus::probe, hfsplus::open),
        BackendId::Ocfs2 => (ocfs2::probe, ocfs2::open),
    }
}
