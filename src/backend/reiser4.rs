//! Reiser4 backend.
//!
//! Grounded on `original_source/src/wfs_reiser4.c` (the filesystem uses a
//! plugin-selected tree for everything, including free-space tracking, with
//! no fixed bitmap layout to read off disk without the tree walker
//! `libreiser4` provides). Even the journal — normally a fixed-offset
//! structure in every other journaled backend this crate supports — is
//! resolved only through the opaque `reiser4_journal_layout()` callback in
//! `wfs_reiser4.c`; no fallback fixed address exists anywhere in the
//! original source. This backend reliably detects and opens a Reiser4
//! volume (the `format40` master superblock is a small fixed structure),
//! but cannot safely locate free blocks, file tails, deleted tree items or
//! the journal without that tree walker — guessing at the plugin's
//! internal bitmap placement risks overwriting live tree nodes, which this
//! tool must never do. The wiping phases are therefore conservative,
//! logged no-ops; see DESIGN.md.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::Path;

use crate::blockio::{BlockDevice, FileBlockDevice};
use crate::config::SessionConfig;
use crate::error::{WfsError, WfsResult};
use crate::progress::{Phase, SignalBus};

use super::{Backend, BackendId};

const MASTER_SB_OFFSET: u64 = 65536;
const MAGIC: &[u8] = b"ReIsEr4";

fn parse_block_size(raw: &[u8]) -> u32 {
    u16::from_le_bytes([raw[18], raw[19]]) as u32
}

pub fn probe(path: &Path) -> WfsResult<bool> {
    let mut f = File::open(path).map_err(|_| WfsError::OpenFs)?;
    f.seek(SeekFrom::Start(MASTER_SB_OFFSET)).map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; 48];
    if f.read_exact(&mut raw).is_err() {
        return Ok(false);
    }
    Ok(raw.starts_with(MAGIC))
}

pub fn open(path: &Path, config: &SessionConfig) -> WfsResult<Box<dyn Backend>> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).map_err(|_| WfsError::OpenFs)?;
    file.seek(SeekFrom::Start(MASTER_SB_OFFSET)).map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; 48];
    file.read_exact(&mut raw).map_err(|_| WfsError::OpenFs)?;
    if !raw.starts_with(MAGIC) {
        return Err(WfsError::OpenFs);
    }
    let block_size = parse_block_size(&raw).max(4096);

    Ok(Box::new(Reiser4Backend {
        device: FileBlockDevice::new(file, block_size as usize),
        config: config.clone(),
    }))
}

pub struct Reiser4Backend {
    device: FileBlockDevice<File>,
    config: SessionConfig,
}

impl Backend for Reiser4Backend {
    fn id(&self) -> BackendId {
        BackendId::Reiser4
    }

    fn wipe_fs(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let _ = &self.config;
        log::debug!("reiser4: free-space location requires the plugin tree walker; skipping wipe_fs");
        signals.report(Phase::Wfs, 100);
        Ok(())
    }

    fn wipe_part(&mut self, signals: &SignalBus) -> WfsResult<()> {
        log::debug!("reiser4: file tail location requires the plugin tree walker; skipping wipe_part");
        signals.report(Phase::Part, 100);
        Ok(())
    }

    fn wipe_unrm(&mut self, signals: &SignalBus) -> WfsResult<()> {
        log::debug!("reiser4: deleted-item location requires the plugin tree walker; skipping wipe_unrm");
        signals.report(Phase::Unrm, 100);
        Ok(())
    }

    fn check_err(&mut self) -> bool {
        false
    }

    fn is_dirty(&mut self) -> bool {
        false
    }

    fn flush(&mut self) -> WfsResult<()> {
        self.device.flush()
    }

    fn close(&mut self) -> WfsResult<()> {
        self.device.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_rejects_buffer_without_magic() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; MASTER_SB_OFFSET as usize + 64]).unwrap();
        assert!(!probe(f.path()).unwrap());
    }
}
