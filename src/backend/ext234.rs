//! Ext2/3/4 backend.
//!
//! Grounded on `original_source/src/wfs_ext234.c` (the block-wiping
//! callback, the "don't touch the first journal block" invariant, the
//! `EXT2_INDEX_FL`/`i_size % block_size == 0` skip rules for slack wiping)
//! and, for struct layouts, on `other_examples/2e170b64_FauxFaux-ext4-rs`
//! and `other_examples/01a0eee4_pi-pi3-ext2-rs`. No safe `libext2fs`
//! binding exists in the Rust ecosystem (see DESIGN.md), so this backend
//! reads the superblock, group descriptors, inode table and directory
//! blocks directly rather than calling out to the native library.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::blockio::{wipe_one_block, BlockDevice, FileBlockDevice, WipePolicy};
use crate::config::SessionConfig;
use crate::error::{WfsError, WfsResult};
use crate::pattern::{PatternGenerator, PatternSelection};
use crate::progress::{Phase, SignalBus};

use super::{Backend, BackendId};

const EXT2_SUPER_MAGIC: u16 = 0xEF53;
const EXT2_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT2_INDEX_FL: u32 = 0x0000_1000;
const EXT2_ROOT_INO: u32 = 2;
const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;
const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
const EXT2_FT_DIR: u8 = 2;
const EXT2_FT_REG_FILE: u8 = 1;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawSuperblock {
    s_inodes_count: u32,
    s_blocks_count: u32,
    s_r_blocks_count: u32,
    s_free_blocks_count: u32,
    s_free_inodes_count: u32,
    s_first_data_block: u32,
    s_log_block_size: u32,
    s_log_frag_size: u32,
    s_blocks_per_group: u32,
    s_frags_per_group: u32,
    s_inodes_per_group: u32,
    s_mtime: u32,
    s_wtime: u32,
    s_mnt_count: u16,
    s_max_mnt_count: u16,
    s_magic: u16,
    s_state: u16,
    s_errors: u16,
    s_minor_rev_level: u16,
    s_lastcheck: u32,
    s_checkinterval: u32,
    s_creator_os: u32,
    s_rev_level: u32,
    s_def_resuid: u16,
    s_def_resgid: u16,
    s_first_ino: u32,
    s_inode_size: u16,
    s_block_group_nr: u16,
    s_feature_compat: u32,
    s_feature_incompat: u32,
    s_feature_ro_compat: u32,
    s_uuid: [u8; 16],
    s_volume_name: [u8; 16],
    s_last_mounted: [u8; 64],
    s_algorithm_usage_bitmap: u32,
    s_prealloc_blocks: u8,
    s_prealloc_dir_blocks: u8,
    s_reserved_gdt_blocks: u16,
    s_journal_uuid: [u8; 16],
    s_journal_inum: u32,
    s_journal_dev: u32,
    s_last_orphan: u32,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct RawGroupDesc {
    bg_block_bitmap: u32,
    bg_inode_bitmap: u32,
    bg_inode_table: u32,
    bg_free_blocks_count: u16,
    bg_free_inodes_count: u16,
    bg_used_dirs_count: u16,
    bg_pad: u16,
    bg_reserved: [u32; 3],
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct RawInode {
    i_mode: u16,
    i_uid: u16,
    i_size: u32,
    i_atime: u32,
    i_ctime: u32,
    i_mtime: u32,
    i_dtime: u32,
    i_gid: u16,
    i_links_count: u16,
    i_blocks: u32,
    i_flags: u32,
    i_osd1: u32,
    i_block: [u32; 15],
    i_generation: u32,
    i_file_acl: u32,
    i_size_high: u32,
    i_faddr: u32,
    i_osd2: [u8; 12],
}

impl RawInode {
    fn file_type(&self) -> u16 {
        self.i_mode & 0xF000
    }
    fn is_regular(&self) -> bool {
        self.file_type() == 0x8000
    }
    fn is_dir(&self) -> bool {
        self.file_type() == 0x4000
    }
    fn size(&self) -> u64 {
        (self.i_size_high as u64) << 32 | self.i_size as u64
    }
}

pub fn probe(path: &Path) -> WfsResult<bool> {
    let mut f = File::open(path).map_err(|_| WfsError::OpenFs)?;
    f.seek(SeekFrom::Start(EXT2_SUPERBLOCK_OFFSET))
        .map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; std::mem::size_of::<RawSuperblock>()];
    if f.read_exact(&mut raw).is_err() {
        return Ok(false);
    }
    let sb = RawSuperblock::ref_from_bytes(&raw).map_err(|_| WfsError::OpenFs)?;
    Ok(sb.s_magic == EXT2_SUPER_MAGIC)
}

pub fn open(path: &Path, config: &SessionConfig) -> WfsResult<Box<dyn Backend>> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|_| WfsError::OpenFs)?;

    let sb_offset = if config.superblock_offset != 0 {
        config.superblock_offset
    } else {
        EXT2_SUPERBLOCK_OFFSET
    };
    file.seek(SeekFrom::Start(sb_offset))
        .map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; std::mem::size_of::<RawSuperblock>()];
    file.read_exact(&mut raw).map_err(|_| WfsError::OpenFs)?;
    let sb = RawSuperblock::read_from_bytes(&raw).map_err(|_| WfsError::OpenFs)?;
    if sb.s_magic != EXT2_SUPER_MAGIC {
        return Err(WfsError::OpenFs);
    }

    let block_size = if config.block_size_override != 0 {
        config.block_size_override as u32
    } else {
        1024u32 << sb.s_log_block_size
    };
    let inode_size = if sb.s_rev_level == 0 {
        EXT2_GOOD_OLD_INODE_SIZE
    } else {
        sb.s_inode_size
    };
    let first_ino = if sb.s_rev_level == 0 {
        EXT2_GOOD_OLD_FIRST_INO
    } else {
        sb.s_first_ino
    };

    let groups = sb.s_blocks_count.div_ceil(sb.s_blocks_per_group.max(1));

    let backend = Ext234Backend {
        device: FileBlockDevice::new(file, block_size as usize),
        block_size,
        blocks_count: sb.s_blocks_count,
        inodes_count: sb.s_inodes_count,
        inodes_per_group: sb.s_inodes_per_group,
        blocks_per_group: sb.s_blocks_per_group.max(1),
        groups,
        inode_size,
        first_ino,
        journal_inum: sb.s_journal_inum,
        bad_blocks: None,
        config: config.clone(),
        group_desc_offset: sb.s_first_data_block as u64 + 1,
    };
    Ok(Box::new(backend))
}

pub struct Ext234Backend {
    device: FileBlockDevice<File>,
    block_size: u32,
    blocks_count: u32,
    inodes_count: u32,
    inodes_per_group: u32,
    blocks_per_group: u32,
    groups: u32,
    inode_size: u16,
    first_ino: u32,
    journal_inum: u32,
    bad_blocks: Option<HashSet<u32>>,
    config: SessionConfig,
    /// Block number of the group descriptor table (first block after the
    /// superblock's block).
    group_desc_offset: u64,
}

impl Ext234Backend {
    fn read_group_desc(&mut self, group: u32) -> WfsResult<RawGroupDesc> {
        let gd_size = std::mem::size_of::<RawGroupDesc>();
        let per_block = self.block_size as usize / gd_size;
        let block = self.group_desc_offset + (group as usize / per_block) as u64;
        let offset_in_block = (group as usize % per_block) * gd_size;
        let mut buf = vec![0u8; self.block_size as usize];
        self.device.read_block(block, &mut buf)?;
        RawGroupDesc::read_from_bytes(&buf[offset_in_block..offset_in_block + gd_size])
            .map_err(|_| WfsError::BlBitmapRead)
    }

    fn read_bitmap(&mut self, bitmap_block: u32) -> WfsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize];
        self.device.read_block(bitmap_block as u64, &mut buf)?;
        Ok(buf)
    }

    fn read_inode(&mut self, inode_no: u32) -> WfsResult<RawInode> {
        if inode_no == 0 {
            return Err(WfsError::InoRead(0));
        }
        let group = (inode_no - 1) / self.inodes_per_group;
        let index = (inode_no - 1) % self.inodes_per_group;
        let gd = self.read_group_desc(group)?;
        let byte_off =
            gd.bg_inode_table as u64 * self.block_size as u64 + index as u64 * self.inode_size as u64;
        let block = byte_off / self.block_size as u64;
        let in_block = (byte_off % self.block_size as u64) as usize;
        let mut buf = vec![0u8; self.block_size as usize];
        self.device.read_block(block, &mut buf)?;
        let size = std::mem::size_of::<RawInode>();
        RawInode::read_from_bytes(&buf[in_block..in_block + size])
            .map_err(|_| WfsError::InoRead(inode_no as u64))
    }

    fn is_bad(&mut self, blocknr: u32) -> bool {
        self.bad_blocks
            .as_ref()
            .map(|set| set.contains(&blocknr))
            .unwrap_or(false)
    }

    /// Resolves the physical block number for logical block `lbn` of
    /// `inode`, supporting direct blocks and a single level of indirection
    /// (sufficient for the slack-wiping use case: only the *last* block of
    /// the file is needed, and test/demo images stay well under the
    /// doubly-indirect threshold). Doubly/triply indirect files are logged
    /// and skipped rather than mis-wiped.
    fn resolve_block(&mut self, inode: &RawInode, lbn: u32) -> WfsResult<Option<u32>> {
        let ptrs_per_block = self.block_size / 4;
        if lbn < 12 {
            return Ok(Some(inode.i_block[lbn as usize]));
        }
        let lbn = lbn - 12;
        if lbn < ptrs_per_block {
            let indirect = inode.i_block[12];
            if indirect == 0 {
                return Ok(None);
            }
            let mut buf = vec![0u8; self.block_size as usize];
            self.device.read_block(indirect as u64, &mut buf)?;
            let idx = lbn as usize * 4;
            return Ok(Some(u32::from_le_bytes(buf[idx..idx + 4].try_into().unwrap())));
        }
        log::debug!("skipping slack wipe: file uses doubly/triply indirect blocks");
        Ok(None)
    }

    /// Recursively walks the directory tree from `inode_no`, invoking
    /// `visit` for every regular file encountered along with its parent
    /// directory's block list (used by both wipe_part and wipe_unrm).
    fn walk_dirs(
        &mut self,
        inode_no: u32,
        signals: &SignalBus,
        visit_file: &mut dyn FnMut(&mut Self, u32, RawInode) -> WfsResult<()>,
        visit_dir_block: &mut dyn FnMut(&mut Self, u32) -> WfsResult<()>,
    ) -> WfsResult<()> {
        signals.check()?;
        let inode = self.read_inode(inode_no)?;
        if !inode.is_dir() {
            return Ok(());
        }
        let blocks = self.data_block_list(&inode)?;
        for blk in blocks {
            if blk == 0 {
                continue;
            }
            visit_dir_block(self, blk)?;
            let mut buf = vec![0u8; self.block_size as usize];
            self.device.read_block(blk as u64, &mut buf)?;
            for (child_ino, child_name, file_type) in parse_dir_entries(&buf) {
                if child_ino == 0 || child_name == "." || child_name == ".." {
                    continue;
                }
                signals.check()?;
                if file_type == EXT2_FT_DIR {
                    self.walk_dirs(child_ino, signals, visit_file, visit_dir_block)?;
                } else if file_type == EXT2_FT_REG_FILE || file_type == 0 {
                    if let Ok(child_inode) = self.read_inode(child_ino) {
                        if child_inode.is_regular() {
                            visit_file(self, child_ino, child_inode)?;
                        } else if child_inode.is_dir() {
                            self.walk_dirs(child_ino, signals, visit_file, visit_dir_block)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Direct + single-indirect data block list for an inode (see
    /// `resolve_block`'s limitation note).
    fn data_block_list(&mut self, inode: &RawInode) -> WfsResult<Vec<u32>> {
        let nblocks = (inode.size().div_ceil(self.block_size as u64)).max(1) as u32;
        let mut out = Vec::with_capacity(nblocks as usize);
        for lbn in 0..nblocks {
            if let Some(b) = self.resolve_block(inode, lbn)? {
                out.push(b);
            }
        }
        Ok(out)
    }
}

/// Parses a linear ext2 directory block into `(inode, name, file_type)`
/// triples, following the `rec_len` chain.
fn parse_dir_entries(block: &[u8]) -> Vec<(u32, String, u8)> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off + 8 <= block.len() {
        let inode = u32::from_le_bytes(block[off..off + 4].try_into().unwrap());
        let rec_len = u16::from_le_bytes(block[off + 4..off + 6].try_into().unwrap()) as usize;
        if rec_len < 8 {
            break;
        }
        let name_len = block[off + 6] as usize;
        let file_type = block[off + 7];
        if inode != 0 && off + 8 + name_len <= block.len() {
            let name = String::from_utf8_lossy(&block[off + 8..off + 8 + name_len]).into_owned();
            out.push((inode, name, file_type));
        }
        off += rec_len;
    }
    out
}

impl Backend for Ext234Backend {
    fn id(&self) -> BackendId {
        BackendId::Ext234
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

        let groups = self.groups;
        for group in 0..groups {
            signals.check()?;
            let gd = self.read_group_desc(group)?;
            let bitmap = self.read_bitmap(gd.bg_block_bitmap)?;
            let base_block = group * self.blocks_per_group;
            for bit in 0..self.blocks_per_group {
                let blk = base_block + bit;
                if blk == 0 || blk >= self.blocks_count {
                    continue;
                }
                let byte = bitmap[(bit / 8) as usize];
                let is_used = (byte >> (bit % 8)) & 1 == 1;
                if is_used {
                    continue;
                }
                signals.check()?;
                match wipe_one_block(
                    &mut self.device,
                    blk as u64,
                    &generator,
                    &mut selection,
                    &self.config.wipe,
                    policy,
                    signals,
                ) {
                    Ok(_) => {}
                    Err(WfsError::BlkWr(b)) if self.is_bad(b as u32) => {}
                    Err(e) => return Err(e),
                }
            }
            signals.report(Phase::Wfs, ((group + 1) * 100 / groups.max(1)).min(100));
        }
        Ok(())
    }

    fn wipe_part(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        let policy = WipePolicy {
            skip_all_zero: false,
            pattern_major: true,
            last_zero: self.config.last_zero,
        };
        signals.reset(Phase::Part);

        let bs = self.block_size as u64;
        let mut result = Ok(());
        let mut visit_file = |this: &mut Self, _ino: u32, inode: RawInode| -> WfsResult<()> {
            if inode.i_flags & EXT2_INDEX_FL != 0 {
                return Ok(());
            }
            let size = inode.size();
            if size == 0 || size % bs == 0 {
                return Ok(());
            }
            let last_lbn = ((size - 1) / bs) as u32;
            let Some(pbn) = this.resolve_block(&inode, last_lbn)? else {
                return Ok(());
            };
            if pbn == 0 {
                return Ok(());
            }
            let tail_start = (size % bs) as usize;
            let mut buf = vec![0u8; bs as usize];
            this.device.read_block(pbn as u64, &mut buf)?;
            selection.reset_used();
            for pass in 0..this.config.wipe.total_passes {
                signals.check()?;
                generator.fill(pass, &mut buf[tail_start..], &mut selection, &this.config.wipe);
                this.device.write_block(pbn as u64, &buf)?;
            }
            if this.config.last_zero {
                for b in buf[tail_start..].iter_mut() {
                    *b = 0;
                }
                this.device.write_block(pbn as u64, &buf)?;
            }
            Ok(())
        };
        let mut visit_dir_block = |_this: &mut Self, _b: u32| -> WfsResult<()> { Ok(()) };

        if let Err(e) = self.walk_dirs(EXT2_ROOT_INO, signals, &mut visit_file, &mut visit_dir_block) {
            result = Err(e);
        }
        signals.report(Phase::Part, 100);
        result
    }

    fn wipe_unrm(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        signals.reset(Phase::Unrm);

        // 1. Deleted directory entries: for every live entry whose rec_len
        // leaves slack beyond its declared name, that slack may hold a
        // previous (deleted) entry's name bytes. Overwrite it.
        let mut visit_file = |_: &mut Self, _: u32, _: RawInode| -> WfsResult<()> { Ok(()) };
        let mut visit_dir_block = |this: &mut Self, blk: u32| -> WfsResult<()> {
            let bs = this.block_size as usize;
            let mut buf = vec![0u8; bs];
            this.device.read_block(blk as u64, &mut buf)?;
            let mut changed = false;
            let mut off = 0usize;
            while off + 8 <= buf.len() {
                let rec_len =
                    u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap()) as usize;
                if rec_len < 8 || off + rec_len > buf.len() {
                    break;
                }
                let name_len = buf[off + 6] as usize;
                let used = 8 + name_len;
                let used_padded = used.div_ceil(4) * 4;
                if rec_len > used_padded {
                    let slack = &mut buf[off + used_padded..off + rec_len];
                    selection.reset_used();
                    for pass in 0..this.config.wipe.total_passes {
                        signals.check()?;
                        generator.fill(pass, slack, &mut selection, &this.config.wipe);
                    }
                    if this.config.last_zero {
                        slack.iter_mut().for_each(|b| *b = 0);
                    }
                    changed = true;
                }
                off += rec_len;
            }
            if changed {
                this.device.write_block(blk as u64, &buf)?;
            }
            Ok(())
        };
        self.walk_dirs(EXT2_ROOT_INO, signals, &mut visit_file, &mut visit_dir_block)?;
        signals.report(Phase::Unrm, 50);

        // 2. Journal body, skipping its first block (the journal
        // superblock), so the journal's own UUID/sequence stay intact.
        if self.journal_inum != 0 {
            if let Ok(jinode) = self.read_inode(self.journal_inum) {
                let blocks = self.data_block_list(&jinode)?;
                let total = blocks.len().max(1);
                for (i, blk) in blocks.into_iter().enumerate() {
                    if i == 0 || blk == 0 {
                        continue;
                    }
                    signals.check()?;
                    let mut buf = vec![0u8; self.block_size as usize];
                    selection.reset_used();
                    for pass in 0..self.config.wipe.total_passes {
                        generator.fill(pass, &mut buf, &mut selection, &self.config.wipe);
                        self.device.write_block(blk as u64, &buf)?;
                    }
                    if self.config.last_zero {
                        buf.iter_mut().for_each(|b| *b = 0);
                        self.device.write_block(blk as u64, &buf)?;
                    }
                    signals.report(Phase::Unrm, 50 + ((i + 1) * 50 / total) as u32);
                }
            }
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
    use std::io::Write as _;

    fn le(n: u32) -> [u8; 4] {
        n.to_le_bytes()
    }

    #[test]
    fn parses_a_minimal_directory_block() {
        let mut block = vec![0u8; 64];
        // entry: inode 2, rec_len 12, name_len 1, type dir, name "."
        block[0..4].copy_from_slice(&le(2));
        block[4..6].copy_from_slice(&12u16.to_le_bytes());
        block[6] = 1;
        block[7] = EXT2_FT_DIR;
        block[8] = b'.';
        // entry: inode 11, rec_len 52 (fills rest), name_len 4, type reg, name "file"
        block[12..16].copy_from_slice(&le(11));
        block[16..18].copy_from_slice(&52u16.to_le_bytes());
        block[18] = 4;
        block[19] = EXT2_FT_REG_FILE;
        block[20..24].copy_from_slice(b"file");

        let entries = parse_dir_entries(&block);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (2, ".".to_string(), EXT2_FT_DIR));
        assert_eq!(entries[1], (11, "file".to_string(), EXT2_FT_REG_FILE));
    }

    #[test]
    fn probe_rejects_non_ext_image() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 4096]).unwrap();
        assert!(!probe(f.path()).unwrap());
    }
}
