//! ReiserFS v3 (3.5/3.6) backend.
//!
//! `original_source/src/wfs_reiser4.c` only ever drives the journal through
//! `reiser4_journal_layout`'s callback — the true reiser4 (`format40`)
//! journal location is opaque, library-resolved, and has no fixed on-disk
//! address (see `reiser4.rs`). Classic ReiserFS v3 is different: its
//! journal's first block and length are ordinary superblock fields
//! (`journal_params.jp_journal_1st_block`/`jp_journal_size` in the public
//! `reiserfs_fs.h` layout), the same source this backend already uses for
//! `s_blocksize`/`s_bmap_nr` in its real bitmap-scan `wipe_fs`. `wipe_unrm`
//! wipes that journal, skipping its first two blocks (the journal header
//! and its first commit block) the way `jfs.rs` skips its log superblock —
//! a "journal-minus-two-blocks" wipe. No safe Rust binding for the
//! balanced-tree item format exists, so file tails (tail-packed items)
//! still need a full B+-tree walk this backend does not implement; see
//! DESIGN.md. `wipe_part` is therefore a conservative no-op rather than a
//! guess that could risk live data.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::Path;

use crate::blockio::{wipe_one_block, BlockDevice, FileBlockDevice, WipePolicy};
use crate::config::SessionConfig;
use crate::error::{WfsError, WfsResult};
use crate::pattern::{PatternGenerator, PatternSelection};
use crate::progress::{Phase, SignalBus};

use super::{Backend, BackendId};

const SUPERBLOCK_OFFSET: u64 = 65536;
const MAGIC_OFFSETS: [&[u8]; 2] = [b"ReIsEr2Fs", b"ReIsErFs"];

struct Superblock {
    block_size: u32,
    bmap_nr: u32,
    journal_1st_block: u32,
    journal_size: u32,
}

fn parse_superblock(raw: &[u8]) -> Option<Superblock> {
    let magic = &raw[52..62];
    let matches_magic = MAGIC_OFFSETS.iter().any(|m| magic.starts_with(m));
    if !matches_magic {
        return None;
    }
    Some(Superblock {
        block_size: u16::from_le_bytes([raw[44], raw[45]]) as u32,
        bmap_nr: u16::from_le_bytes([raw[70], raw[71]]) as u32,
        journal_1st_block: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        journal_size: u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]),
    })
}

pub fn probe(path: &Path) -> WfsResult<bool> {
    let mut f = File::open(path).map_err(|_| WfsError::OpenFs)?;
    f.seek(SeekFrom::Start(SUPERBLOCK_OFFSET)).map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; 76];
    if f.read_exact(&mut raw).is_err() {
        return Ok(false);
    }
    Ok(parse_superblock(&raw).is_some())
}

pub fn open(path: &Path, config: &SessionConfig) -> WfsResult<Box<dyn Backend>> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).map_err(|_| WfsError::OpenFs)?;
    file.seek(SeekFrom::Start(SUPERBLOCK_OFFSET)).map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; 76];
    file.read_exact(&mut raw).map_err(|_| WfsError::OpenFs)?;
    let sb = parse_superblock(&raw).ok_or(WfsError::OpenFs)?;

    Ok(Box::new(ReiserV3Backend {
        device: FileBlockDevice::new(file, sb.block_size as usize),
        sb,
        config: config.clone(),
    }))
}

pub struct ReiserV3Backend {
    device: FileBlockDevice<File>,
    sb: Superblock,
    config: SessionConfig,
}

impl Backend for ReiserV3Backend {
    fn id(&self) -> BackendId {
        BackendId::ReiserV3
    }

    fn wipe_fs(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        let policy = WipePolicy {
            skip_all_zero: self.config.skip_all_zero_blocks,
            pattern_major: true,
            last_zero: self.config.last_zero,
        };
        signals.reset(Phase::Wfs);

        let sb_block = SUPERBLOCK_OFFSET / self.sb.block_size as u64;
        let bits_per_bitmap = self.sb.block_size * 8;

        for bmap_idx in 0..self.sb.bmap_nr {
            signals.check()?;
            let bitmap_block = if bmap_idx == 0 {
                sb_block + 1
            } else {
                bmap_idx as u64 * bits_per_bitmap as u64
            };
            let mut bitmap = vec![0u8; self.sb.block_size as usize];
            self.device.read_block(bitmap_block, &mut bitmap)?;
            for (byte_idx, byte) in bitmap.iter().enumerate() {
                for bit in 0..8u32 {
                    if (byte >> bit) & 1 == 1 {
                        continue;
                    }
                    let blk = bmap_idx as u64 * bits_per_bitmap as u64 + byte_idx as u64 * 8 + bit as u64;
                    if blk == 0 || blk == bitmap_block {
                        continue;
                    }
                    signals.check()?;
                    wipe_one_block(
                        &mut self.device,
                        blk,
                        &generator,
                        &mut selection,
                        &self.config.wipe,
                        policy,
                        signals,
                    )?;
                }
            }
            signals.report(Phase::Wfs, ((bmap_idx + 1) * 100 / self.sb.bmap_nr.max(1)).min(100));
        }
        Ok(())
    }

    fn wipe_part(&mut self, signals: &SignalBus) -> WfsResult<()> {
        log::debug!("reiserfs v3: slack wiping needs a balanced-tree item walk this backend does not implement; skipping");
        signals.report(Phase::Part, 100);
        Ok(())
    }

    fn wipe_unrm(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        let policy = WipePolicy {
            skip_all_zero: false,
            pattern_major: true,
            last_zero: self.config.last_zero,
        };
        signals.reset(Phase::Unrm);

        if self.sb.journal_size < 3 {
            log::debug!("reiserfs v3: journal too small to hold wipable body blocks; skipping wipe_unrm");
            signals.report(Phase::Unrm, 100);
            return Ok(());
        }
        let body_blocks = (self.sb.journal_size - 2) as u64;
        let body_start = self.sb.journal_1st_block as u64 + 2;
        for i in 0..body_blocks {
            signals.check()?;
            wipe_one_block(
                &mut self.device,
                body_start + i,
                &generator,
                &mut selection,
                &self.config.wipe,
                policy,
                signals,
            )?;
            signals.report(Phase::Unrm, (((i + 1) * 100) / body_blocks.max(1)) as u32);
        }
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
    fn probe_rejects_wrong_magic() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; SUPERBLOCK_OFFSET as usize + 128]).unwrap();
        assert!(!probe(f.path()).unwrap());
    }

    #[test]
    fn recognizes_3_6_magic() {
        let mut raw = [0u8; 76];
        raw[52..61].copy_from_slice(b"ReIsEr2Fs");
        raw[44] = 0x00;
        raw[45] = 0x10; // 4096
        let sb = parse_superblock(&raw).unwrap();
        assert_eq!(sb.block_size, 4096);
    }
}
