//! The flat error taxonomy shared by every component.
//!
//! One variant per row of the error table; propagation rules (fatal per
//! device, fatal per operation, logged-and-swallowed, ...) are documented on
//! each variant and enforced by callers, not by this type.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the engine.
pub type WfsResult<T> = Result<T, WfsError>;

/// The flat, tagged error enum of the error handling design.
#[derive(Debug, Error)]
pub enum WfsError {
    /// Nothing was selected, or help/version text was shown.
    #[error("nothing to do")]
    Nothing,
    /// Command line arguments could not be parsed.
    #[error("could not parse command line arguments")]
    BadCmdln,
    /// The mount table could not be consulted.
    #[error("could not determine whether the filesystem is mounted")]
    MntChk(#[source] std::io::Error),
    /// The device is mounted read-write.
    #[error("device is mounted in read+write mode")]
    MntRw,
    /// A backend failed to open the filesystem.
    #[error("could not open filesystem")]
    OpenFs,
    /// A backend failed to close the filesystem.
    #[error("could not close filesystem")]
    FsClose,
    /// Memory allocation failure.
    #[error("memory allocation failed")]
    MallocErr,
    /// `check_err` reported a dirty filesystem and `--force` was not given.
    #[error("filesystem has errors (use --force to wipe anyway)")]
    FsHasError,
    /// The allocation bitmap could not be loaded.
    #[error("could not read the block allocation bitmap")]
    BlBitmapRead,
    /// A single block write failed.
    #[error("could not write block {0}")]
    BlkWr(u64),
    /// A single block read failed.
    #[error("could not read block {0}")]
    BlkRd(u64),
    /// An inode could not be read.
    #[error("could not read inode {0}")]
    InoRead(u64),
    /// An inode scan could not be started or continued.
    #[error("inode scan failed")]
    InoScan,
    /// A block iterator over an inode's data blocks failed.
    #[error("block iteration failed")]
    BlkIter,
    /// A directory iterator failed.
    #[error("directory iteration failed")]
    DirIter,
    /// Flushing to the device failed (logged, non-fatal).
    #[error("flush to device failed")]
    FlushFs(#[source] std::io::Error),
    /// Opening an NTFS attribute failed.
    #[error("could not open attribute")]
    AttrOpen,
    /// Walking an NTFS runlist failed.
    #[error("could not walk runlist")]
    NtfsRunlist,
    /// A Reiser4 tree-walk context failed.
    #[error("tree-walk context error")]
    CtxError,
    /// A null pointer or out-of-range argument was passed.
    #[error("bad parameter")]
    BadParam,
    /// A pipe to/from a child process failed.
    #[error("pipe error")]
    PipeErr,
    /// `fork` failed.
    #[error("fork failed")]
    ForkErr(#[source] nix::Error),
    /// `exec` of an external tool failed.
    #[error("exec failed: {0}")]
    ExecErr(String),
    /// A `seek` failed.
    #[error("seek failed")]
    SeekErr(#[source] std::io::Error),
    /// An ioctl failed.
    #[error("ioctl failed")]
    Ioctl(#[source] nix::Error),
    /// Cooperative cancellation: a signal was received.
    #[error("cancelled by signal {0}")]
    Signal(i32),
}

impl WfsError {
    /// Numeric error code matching the historical `(err N)` scheme, used
    /// only for the user-facing message and the process exit status.
    pub fn code(&self) -> i32 {
        match self {
            WfsError::Nothing => 1,
            WfsError::BadCmdln => 2,
            WfsError::MntChk(_) => 3,
            WfsError::MntRw => 4,
            WfsError::OpenFs => 5,
            WfsError::FsClose => 6,
            WfsError::MallocErr => 7,
            WfsError::FsHasError => 8,
            WfsError::BlBitmapRead => 9,
            WfsError::BlkWr(_) => 10,
            WfsError::BlkRd(_) => 11,
            WfsError::InoRead(_) => 12,
            WfsError::InoScan => 13,
            WfsError::BlkIter => 14,
            WfsError::DirIter => 15,
            WfsError::FlushFs(_) => 16,
            WfsError::AttrOpen => 17,
            WfsError::NtfsRunlist => 18,
            WfsError::CtxError => 19,
            WfsError::BadParam => 20,
            WfsError::PipeErr => 21,
            WfsError::ForkErr(_) => 22,
            WfsError::ExecErr(_) => 23,
            WfsError::SeekErr(_) => 24,
            WfsError::Ioctl(_) => 25,
            WfsError::Signal(_) => 26,
        }
    }

    /// True for kinds that the dispatcher treats as immediately fatal
    /// across every remaining device, per spec.md §7.
    pub fn aborts_whole_run(&self) -> bool {
        matches!(self, WfsError::Signal(_) | WfsError::ForkErr(_))
    }
}

/// Formats the standard one-line failure message:
/// `prog:dev: (err N) <message> '<context>', FS='<dev>'`
pub fn format_failure_line(prog: &str, dev: &PathBuf, err: &WfsError, context: &str) -> String {
    struct Ctx<'a>(&'a str);
    impl fmt::Display for Ctx<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    format!(
        "{prog}:{dev}: (err {code}) {msg} '{ctx}', FS='{dev}'",
        prog = prog,
        dev = dev.display(),
        code = err.code(),
        msg = err,
        ctx = Ctx(context),
    )
}
