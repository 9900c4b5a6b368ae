//! MinixFS (V1) backend.
//!
//! Grounded on `original_source/src/wfs_minixfs.c` (root-inode constant,
//! magic values, directory-wipe entry point) and the classic Linux
//! `minix_fs.h` on-disk layout for the parts libminixfs has no Rust
//! equivalent for (see DESIGN.md).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::Path;

use crate::blockio::{wipe_one_block, BlockDevice, FileBlockDevice, WipePolicy};
use crate::config::SessionConfig;
use crate::error::{WfsError, WfsResult};
use crate::pattern::{PatternGenerator, PatternSelection};
use crate::progress::{Phase, SignalBus};

use super::{Backend, BackendId};

const MINIX_BLOCK_SIZE: u32 = 1024;
const MINIX_SUPER_MAGIC: u16 = 0x137F;
const MINIX_SUPER_MAGIC2: u16 = 0x138F;
const MINIX_ROOT_INO: u32 = 1;
const MINIX_INODE_SIZE: u32 = 32;
const MINIX_DIRENT_SIZE: usize = 16;
const MINIX_NAME_LEN: usize = 14;

struct Superblock {
    ninodes: u32,
    imap_blocks: u32,
    zmap_blocks: u32,
    firstdatazone: u32,
    magic: u16,
}

fn parse_superblock(raw: &[u8]) -> Superblock {
    Superblock {
        ninodes: u16::from_le_bytes([raw[0], raw[1]]) as u32,
        imap_blocks: u16::from_le_bytes([raw[4], raw[5]]) as u32,
        zmap_blocks: u16::from_le_bytes([raw[6], raw[7]]) as u32,
        firstdatazone: u16::from_le_bytes([raw[8], raw[9]]) as u32,
        magic: u16::from_le_bytes([raw[14], raw[15]]),
    }
}

pub fn probe(path: &Path) -> WfsResult<bool> {
    let mut f = File::open(path).map_err(|_| WfsError::OpenFs)?;
    f.seek(SeekFrom::Start(MINIX_BLOCK_SIZE as u64)).map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; 32];
    if f.read_exact(&mut raw).is_err() {
        return Ok(false);
    }
    let sb = parse_superblock(&raw);
    Ok(sb.magic == MINIX_SUPER_MAGIC || sb.magic == MINIX_SUPER_MAGIC2)
}

pub fn open(path: &Path, config: &SessionConfig) -> WfsResult<Box<dyn Backend>> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).map_err(|_| WfsError::OpenFs)?;
    file.seek(SeekFrom::Start(MINIX_BLOCK_SIZE as u64)).map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; 32];
    file.read_exact(&mut raw).map_err(|_| WfsError::OpenFs)?;
    let sb = parse_superblock(&raw);
    if sb.magic != MINIX_SUPER_MAGIC && sb.magic != MINIX_SUPER_MAGIC2 {
        return Err(WfsError::OpenFs);
    }

    let imap_start = 2u32; // boot block (0) + superblock (1)
    let zmap_start = imap_start + sb.imap_blocks;
    let inode_table_start = zmap_start + sb.zmap_blocks;
    let inode_table_blocks = (sb.ninodes * MINIX_INODE_SIZE).div_ceil(MINIX_BLOCK_SIZE);

    Ok(Box::new(MinixBackend {
        device: FileBlockDevice::new(file, MINIX_BLOCK_SIZE as usize),
        sb,
        zmap_start,
        inode_table_start,
        inode_table_blocks,
        config: config.clone(),
    }))
}

pub struct MinixBackend {
    device: FileBlockDevice<File>,
    sb: Superblock,
    zmap_start: u32,
    inode_table_start: u32,
    inode_table_blocks: u32,
    config: SessionConfig,
}

#[derive(Clone, Copy)]
struct Inode {
    mode: u16,
    size: u32,
    zone: [u16; 9],
}

impl Inode {
    fn is_dir(&self) -> bool {
        self.mode & 0xF000 == 0x4000
    }
    fn is_regular(&self) -> bool {
        self.mode & 0xF000 == 0x8000
    }
}

impl MinixBackend {
    fn read_inode(&mut self, ino: u32) -> WfsResult<Inode> {
        let idx = ino - 1;
        let byte_off =
            self.inode_table_start as u64 * MINIX_BLOCK_SIZE as u64 + idx as u64 * MINIX_INODE_SIZE as u64;
        let block = byte_off / MINIX_BLOCK_SIZE as u64;
        let in_block = (byte_off % MINIX_BLOCK_SIZE as u64) as usize;
        let mut buf = vec![0u8; MINIX_BLOCK_SIZE as usize];
        self.device.read_block(block, &mut buf)?;
        let raw = &buf[in_block..in_block + MINIX_INODE_SIZE as usize];
        let mode = u16::from_le_bytes([raw[0], raw[1]]);
        let size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let mut zone = [0u16; 9];
        for (i, z) in zone.iter_mut().enumerate() {
            let off = 12 + i * 2;
            *z = u16::from_le_bytes([raw[off], raw[off + 1]]);
        }
        Ok(Inode { mode, size, zone })
    }

    fn last_zone(&mut self, inode: &Inode) -> WfsResult<Option<u32>> {
        if inode.size == 0 {
            return Ok(None);
        }
        let last_lbn = (inode.size - 1) / MINIX_BLOCK_SIZE;
        if last_lbn < 7 {
            let z = inode.zone[last_lbn as usize] as u32;
            return Ok(if z == 0 { None } else { Some(z) });
        }
        let lbn = last_lbn - 7;
        let ptrs_per_block = MINIX_BLOCK_SIZE / 2;
        if lbn < ptrs_per_block {
            let indirect = inode.zone[7] as u32;
            if indirect == 0 {
                return Ok(None);
            }
            let mut buf = vec![0u8; MINIX_BLOCK_SIZE as usize];
            self.device.read_block(indirect as u64, &mut buf)?;
            let idx = lbn as usize * 2;
            let z = u16::from_le_bytes([buf[idx], buf[idx + 1]]) as u32;
            return Ok(if z == 0 { None } else { Some(z) });
        }
        log::debug!("skipping slack wipe: file uses doubly-indirect zones");
        Ok(None)
    }

    fn walk_dir(
        &mut self,
        ino: u32,
        signals: &SignalBus,
        visit_file: &mut dyn FnMut(&mut Self, Inode) -> WfsResult<()>,
        visit_dir_block: &mut dyn FnMut(&mut Self, u32) -> WfsResult<()>,
    ) -> WfsResult<()> {
        signals.check()?;
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Ok(());
        }
        let nblocks = inode.size.div_ceil(MINIX_BLOCK_SIZE).max(1);
        for lbn in 0..nblocks.min(7) {
            let zone = inode.zone[lbn as usize] as u32;
            if zone == 0 {
                continue;
            }
            visit_dir_block(self, zone)?;
            let mut buf = vec![0u8; MINIX_BLOCK_SIZE as usize];
            self.device.read_block(zone as u64, &mut buf)?;
            for chunk in buf.chunks(MINIX_DIRENT_SIZE) {
                let child_ino = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
                if child_ino == 0 {
                    continue;
                }
                let nul = chunk[2..2 + MINIX_NAME_LEN]
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(MINIX_NAME_LEN);
                let name = String::from_utf8_lossy(&chunk[2..2 + nul]).into_owned();
                if name == "." || name == ".." {
                    continue;
                }
                signals.check()?;
                let child = self.read_inode(child_ino)?;
                if child.is_dir() {
                    self.walk_dir(child_ino, signals, visit_file, visit_dir_block)?;
                } else if child.is_regular() {
                    visit_file(self, child)?;
                }
            }
        }
        Ok(())
    }
}

impl Backend for MinixBackend {
    fn id(&self) -> BackendId {
        BackendId::MinixFs
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

        for zmap_blk in 0..self.sb.zmap_blocks {
            signals.check()?;
            let mut bitmap = vec![0u8; MINIX_BLOCK_SIZE as usize];
            self.device.read_block((self.zmap_start + zmap_blk) as u64, &mut bitmap)?;
            for (byte_idx, byte) in bitmap.iter().enumerate() {
                for bit in 0..8u32 {
                    if (byte >> bit) & 1 == 1 {
                        continue;
                    }
                    // zone numbering in the bitmap is 0-based from zone 0;
                    // zones below firstdatazone (and bit 0, reserved) are
                    // never real data zones.
                    let zone_rel = zmap_blk * MINIX_BLOCK_SIZE * 8 + byte_idx as u32 * 8 + bit;
                    if zone_rel < self.sb.firstdatazone || zone_rel == 0 {
                        continue;
                    }
                    signals.check()?;
                    wipe_one_block(
                        &mut self.device,
                        zone_rel as u64,
                        &generator,
                        &mut selection,
                        &self.config.wipe,
                        policy,
                        signals,
                    )?;
                }
            }
            signals.report(Phase::Wfs, ((zmap_blk + 1) * 100 / self.sb.zmap_blocks.max(1)).min(100));
        }
        Ok(())
    }

    fn wipe_part(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        signals.reset(Phase::Part);

        let mut visit_file = |this: &mut Self, inode: Inode| -> WfsResult<()> {
            if inode.size == 0 || inode.size % MINIX_BLOCK_SIZE == 0 {
                return Ok(());
            }
            let Some(zone) = this.last_zone(&inode)? else {
                return Ok(());
            };
            let tail_start = (inode.size % MINIX_BLOCK_SIZE) as usize;
            let mut buf = vec![0u8; MINIX_BLOCK_SIZE as usize];
            this.device.read_block(zone as u64, &mut buf)?;
            selection.reset_used();
            for pass in 0..this.config.wipe.total_passes {
                signals.check()?;
                generator.fill(pass, &mut buf[tail_start..], &mut selection, &this.config.wipe);
                this.device.write_block(zone as u64, &buf)?;
            }
            if this.config.last_zero {
                buf[tail_start..].iter_mut().for_each(|b| *b = 0);
                this.device.write_block(zone as u64, &buf)?;
            }
            Ok(())
        };
        let mut visit_dir_block = |_: &mut Self, _: u32| -> WfsResult<()> { Ok(()) };
        self.walk_dir(MINIX_ROOT_INO, signals, &mut visit_file, &mut visit_dir_block)?;
        signals.report(Phase::Part, 100);
        Ok(())
    }

    fn wipe_unrm(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        signals.reset(Phase::Unrm);

        let mut visit_file = |_: &mut Self, _: Inode| -> WfsResult<()> { Ok(()) };
        let mut visit_dir_block = |this: &mut Self, zone: u32| -> WfsResult<()> {
            let mut buf = vec![0u8; MINIX_BLOCK_SIZE as usize];
            this.device.read_block(zone as u64, &mut buf)?;
            let mut changed = false;
            for chunk in buf.chunks_mut(MINIX_DIRENT_SIZE) {
                let ino = u16::from_le_bytes([chunk[0], chunk[1]]);
                if ino != 0 {
                    continue;
                }
                // A zeroed inode number with leftover name bytes is a
                // deleted entry; the name itself may still be present.
                if chunk[2..].iter().any(|&b| b != 0) {
                    selection.reset_used();
                    for pass in 0..this.config.wipe.total_passes {
                        signals.check()?;
                        generator.fill(pass, &mut chunk[2..], &mut selection, &this.config.wipe);
                    }
                    if this.config.last_zero {
                        chunk[2..].iter_mut().for_each(|b| *b = 0);
                    }
                    changed = true;
                }
            }
            if changed {
                this.device.write_block(zone as u64, &buf)?;
            }
            Ok(())
        };
        self.walk_dir(MINIX_ROOT_INO, signals, &mut visit_file, &mut visit_dir_block)?;
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
    fn probe_rejects_non_minix_image() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 4096]).unwrap();
        assert!(!probe(f.path()).unwrap());
    }

    #[test]
    fn superblock_parses_known_magic() {
        let mut raw = [0u8; 32];
        raw[14] = 0x7F;
        raw[15] = 0x13;
        let sb = parse_superblock(&raw);
        assert_eq!(sb.magic, MINIX_SUPER_MAGIC);
    }
}
