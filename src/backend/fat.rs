//! FAT12/16/32 backend.
//!
//! The original implementation (`original_source/src/wfs_fat.c`) is built on
//! TFFS, a C library with no Rust binding in the ecosystem. This backend
//! instead parses the BIOS Parameter Block, FAT table and directory entries
//! directly, the way `other_examples/3caddcba_jskoetsier-nwipe` reads raw
//! on-disk structures for its wipe methods.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::SessionConfig;
use crate::error::{WfsError, WfsResult};
use crate::pattern::{PatternGenerator, PatternSelection};
use crate::progress::{Phase, SignalBus};

use super::{Backend, BackendId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

pub fn probe(path: &Path) -> WfsResult<bool> {
    let mut f = File::open(path).map_err(|_| WfsError::OpenFs)?;
    let mut boot = [0u8; 512];
    f.read_exact(&mut boot).map_err(|_| WfsError::OpenFs)?;
    // Every FAT boot sector ends in the 0x55 0xAA signature.
    Ok(boot[510] == 0x55 && boot[511] == 0xAA && looks_like_fat_bpb(&boot))
}

fn looks_like_fat_bpb(boot: &[u8]) -> bool {
    let bytes_per_sec = u16::from_le_bytes([boot[11], boot[12]]);
    let sec_per_clus = boot[13];
    (bytes_per_sec == 512 || bytes_per_sec == 1024 || bytes_per_sec == 2048 || bytes_per_sec == 4096)
        && sec_per_clus != 0
        && (sec_per_clus & (sec_per_clus - 1)) == 0
}

struct Bpb {
    bytes_per_sec: u32,
    sec_per_clus: u32,
    reserved_sec: u32,
    num_fats: u32,
    root_entries: u32,
    total_sec: u32,
    sec_per_fat: u32,
    root_cluster: u32,
    variant: FatVariant,
}

fn parse_bpb(boot: &[u8]) -> Bpb {
    let bytes_per_sec = u16::from_le_bytes([boot[11], boot[12]]) as u32;
    let sec_per_clus = boot[13] as u32;
    let reserved_sec = u16::from_le_bytes([boot[14], boot[15]]) as u32;
    let num_fats = boot[16] as u32;
    let root_entries = u16::from_le_bytes([boot[17], boot[18]]) as u32;
    let total_sec16 = u16::from_le_bytes([boot[19], boot[20]]) as u32;
    let sec_per_fat16 = u16::from_le_bytes([boot[22], boot[23]]) as u32;
    let total_sec32 = u32::from_le_bytes([boot[32], boot[33], boot[34], boot[35]]);
    let sec_per_fat32 = u32::from_le_bytes([boot[36], boot[37], boot[38], boot[39]]);
    let root_cluster32 = u32::from_le_bytes([boot[44], boot[45], boot[46], boot[47]]);

    let total_sec = if total_sec16 != 0 { total_sec16 } else { total_sec32 };
    let sec_per_fat = if sec_per_fat16 != 0 { sec_per_fat16 } else { sec_per_fat32 };

    let root_dir_sectors = (root_entries * 32).div_ceil(bytes_per_sec.max(1));
    let data_sec = total_sec - (reserved_sec + num_fats * sec_per_fat + root_dir_sectors);
    let clus_count = data_sec / sec_per_clus.max(1);

    let variant = if sec_per_fat16 == 0 {
        FatVariant::Fat32
    } else if clus_count < 4085 {
        FatVariant::Fat12
    } else {
        FatVariant::Fat16
    };

    Bpb {
        bytes_per_sec,
        sec_per_clus,
        reserved_sec,
        num_fats,
        root_entries,
        total_sec,
        sec_per_fat,
        root_cluster: if variant == FatVariant::Fat32 { root_cluster32 } else { 0 },
        variant,
    }
}

pub fn open(path: &Path, config: &SessionConfig) -> WfsResult<Box<dyn Backend>> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).map_err(|_| WfsError::OpenFs)?;
    let mut boot = [0u8; 512];
    file.read_exact(&mut boot).map_err(|_| WfsError::OpenFs)?;
    if boot[510] != 0x55 || boot[511] != 0xAA {
        return Err(WfsError::OpenFs);
    }
    let bpb = parse_bpb(&boot);

    let fat_start_byte = bpb.reserved_sec as u64 * bpb.bytes_per_sec as u64;
    let root_dir_start_byte =
        fat_start_byte + bpb.num_fats as u64 * bpb.sec_per_fat as u64 * bpb.bytes_per_sec as u64;
    let root_dir_sectors = (bpb.root_entries * 32).div_ceil(bpb.bytes_per_sec.max(1));
    let data_start_byte = root_dir_start_byte + root_dir_sectors as u64 * bpb.bytes_per_sec as u64;

    Ok(Box::new(FatBackend {
        file,
        bpb,
        fat_start_byte,
        root_dir_start_byte,
        root_dir_sectors,
        data_start_byte,
        config: config.clone(),
    }))
}

pub struct FatBackend {
    file: File,
    bpb: Bpb,
    fat_start_byte: u64,
    root_dir_start_byte: u64,
    root_dir_sectors: u32,
    data_start_byte: u64,
    config: SessionConfig,
}

impl FatBackend {
    fn cluster_size(&self) -> u64 {
        (self.bpb.bytes_per_sec * self.bpb.sec_per_clus) as u64
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start_byte + (cluster as u64 - 2) * self.cluster_size()
    }

    fn total_clusters(&self) -> u32 {
        let data_bytes_start_sec = self.bpb.reserved_sec
            + self.bpb.num_fats * self.bpb.sec_per_fat
            + self.root_dir_sectors;
        (self.bpb.total_sec.saturating_sub(data_bytes_start_sec)) / self.bpb.sec_per_clus.max(1)
    }

    fn read_fat_entry(&mut self, cluster: u32) -> WfsResult<u32> {
        match self.bpb.variant {
            FatVariant::Fat12 => {
                let byte_off = self.fat_start_byte + (cluster as u64 * 3) / 2;
                let mut buf = [0u8; 2];
                self.raw_read(byte_off, &mut buf)?;
                let val = u16::from_le_bytes(buf);
                Ok(if cluster % 2 == 0 {
                    (val & 0x0FFF) as u32
                } else {
                    (val >> 4) as u32
                })
            }
            FatVariant::Fat16 => {
                let byte_off = self.fat_start_byte + cluster as u64 * 2;
                let mut buf = [0u8; 2];
                self.raw_read(byte_off, &mut buf)?;
                Ok(u16::from_le_bytes(buf) as u32)
            }
            FatVariant::Fat32 => {
                let byte_off = self.fat_start_byte + cluster as u64 * 4;
                let mut buf = [0u8; 4];
                self.raw_read(byte_off, &mut buf)?;
                Ok(u32::from_le_bytes(buf) & 0x0FFF_FFFF)
            }
        }
    }

    fn is_free_entry(&self, entry: u32) -> bool {
        entry == 0
    }

    fn raw_read(&mut self, byte_off: u64, buf: &mut [u8]) -> WfsResult<()> {
        self.file.seek(SeekFrom::Start(byte_off)).map_err(WfsError::SeekErr)?;
        self.file.read_exact(buf).map_err(|_| WfsError::BlkRd(byte_off))
    }

    fn raw_write(&mut self, byte_off: u64, buf: &[u8]) -> WfsResult<()> {
        self.file.seek(SeekFrom::Start(byte_off)).map_err(WfsError::SeekErr)?;
        self.file.write_all(buf).map_err(|_| WfsError::BlkWr(byte_off))
    }

    fn cluster_chain(&mut self, mut cluster: u32) -> WfsResult<Vec<u32>> {
        let mut chain = Vec::new();
        let max_marker = match self.bpb.variant {
            FatVariant::Fat12 => 0x0FF8,
            FatVariant::Fat16 => 0xFFF8,
            FatVariant::Fat32 => 0x0FFF_FFF8,
        };
        let mut guard = 0u32;
        while cluster >= 2 && cluster < max_marker && guard < self.total_clusters() + 16 {
            chain.push(cluster);
            cluster = self.read_fat_entry(cluster)?;
            guard += 1;
        }
        Ok(chain)
    }

    fn wipe_bytes(
        &mut self,
        byte_off: u64,
        len: usize,
        generator: &PatternGenerator,
        selection: &mut PatternSelection,
        signals: &SignalBus,
    ) -> WfsResult<()> {
        selection.reset_used();
        let mut buf = vec![0u8; len];
        for pass in 0..self.config.wipe.total_passes {
            signals.check()?;
            generator.fill(pass, &mut buf, selection, &self.config.wipe);
            self.raw_write(byte_off, &buf)?;
        }
        if self.config.last_zero {
            buf.iter_mut().for_each(|b| *b = 0);
            self.raw_write(byte_off, &buf)?;
        }
        Ok(())
    }

}

impl Backend for FatBackend {
    fn id(&self) -> BackendId {
        BackendId::Fat
    }

    fn wipe_fs(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        signals.reset(Phase::Wfs);

        let total = self.total_clusters();
        for cluster in 2..(2 + total) {
            signals.check()?;
            let entry = self.read_fat_entry(cluster)?;
            if !self.is_free_entry(entry) {
                continue;
            }
            let off = self.cluster_offset(cluster);
            let size = self.cluster_size() as usize;
            self.wipe_bytes(off, size, &generator, &mut selection, signals)?;
            if cluster % 256 == 0 {
                signals.report(Phase::Wfs, ((cluster as u64) * 100 / total.max(1) as u64) as u32);
            }
        }
        signals.report(Phase::Wfs, 100);
        Ok(())
    }

    fn wipe_part(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        signals.reset(Phase::Part);
        let clus_size = self.cluster_size();

        self.walk_files(signals, &mut |this, size, first_cluster| {
            if size == 0 {
                return Ok(());
            }
            let tail_in_last = size % clus_size;
            if tail_in_last == 0 {
                return Ok(());
            }
            let chain = this.cluster_chain(first_cluster)?;
            let Some(&last) = chain.last() else {
                return Ok(());
            };
            let off = this.cluster_offset(last) + tail_in_last;
            let len = (clus_size - tail_in_last) as usize;
            this.wipe_bytes(off, len, &generator, &mut selection, signals)
        })?;
        signals.report(Phase::Part, 100);
        Ok(())
    }

    fn wipe_unrm(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        signals.reset(Phase::Unrm);

        self.walk_dir_slots(signals, &mut |this, slot, offset| {
            // 0xE5 marks a deleted entry; byte 0 itself is the marker FAT's
            // own scavenging tools rely on to tell a free slot from a live
            // one, so it is read-only here. The remaining 31 bytes may still
            // carry the old name/cluster/size and get wiped.
            if slot[0] == 0xE5 {
                selection.reset_used();
                let mut buf = vec![0u8; 31];
                for pass in 0..this.config.wipe.total_passes {
                    signals.check()?;
                    generator.fill(pass, &mut buf, &mut selection, &this.config.wipe);
                    this.raw_write(offset + 1, &buf)?;
                }
                if this.config.last_zero {
                    this.raw_write(offset + 1, &vec![0u8; 31])?;
                }
            }
            Ok(())
        })?;
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
        self.file.flush().map_err(WfsError::FlushFs)
    }

    fn close(&mut self) -> WfsResult<()> {
        self.file.flush().map_err(WfsError::FlushFs)
    }
}

impl FatBackend {
    /// Visits every directory slot reachable from the root directory,
    /// recursing into sub-directories via their first cluster.
    fn walk_dir_slots(
        &mut self,
        signals: &SignalBus,
        on_entry: &mut dyn FnMut(&mut Self, &[u8], u64) -> WfsResult<()>,
    ) -> WfsResult<()> {
        let root_bytes = self.read_root_dir()?;
        self.walk_dir_bytes(&root_bytes, self.root_dir_start_byte, signals, on_entry, true)
    }

    fn walk_dir_bytes(
        &mut self,
        bytes: &[u8],
        base_offset: u64,
        signals: &SignalBus,
        on_entry: &mut dyn FnMut(&mut Self, &[u8], u64) -> WfsResult<()>,
        is_root: bool,
    ) -> WfsResult<()> {
        let mut subdirs = Vec::new();
        for (i, chunk) in bytes.chunks(32).enumerate() {
            if chunk.len() < 32 || chunk[0] == 0x00 {
                continue;
            }
            signals.check()?;
            on_entry(self, chunk, base_offset + (i * 32) as u64)?;
            let attr = chunk[11];
            let is_dir = attr & 0x10 != 0;
            let name0 = chunk[0];
            if is_dir && name0 != 0xE5 && name0 != 0x2E {
                let first = first_cluster_of(chunk, self.bpb.variant);
                if first >= 2 {
                    subdirs.push(first);
                }
            }
        }
        let _ = is_root;
        for first in subdirs {
            let data = self.read_cluster_chain_bytes(first)?;
            self.walk_dir_bytes(&data, self.cluster_offset(first), signals, on_entry, false)?;
        }
        Ok(())
    }

    fn walk_files(
        &mut self,
        signals: &SignalBus,
        on_file: &mut dyn FnMut(&mut Self, u64, u32) -> WfsResult<()>,
    ) -> WfsResult<()> {
        self.walk_dir_slots(signals, &mut |this, slot, _off| {
            let attr = slot[11];
            let name0 = slot[0];
            if attr & 0x10 == 0 && attr & 0x08 == 0 && name0 != 0xE5 {
                let size = u32::from_le_bytes([slot[28], slot[29], slot[30], slot[31]]) as u64;
                let first = first_cluster_of(slot, this.bpb.variant);
                if first >= 2 {
                    on_file(this, size, first)?;
                }
            }
            Ok(())
        })
    }

    fn read_root_dir(&mut self) -> WfsResult<Vec<u8>> {
        if self.bpb.variant == FatVariant::Fat32 {
            self.read_cluster_chain_bytes(self.bpb.root_cluster)
        } else {
            let len = (self.root_dir_sectors * self.bpb.bytes_per_sec) as usize;
            let mut buf = vec![0u8; len];
            self.raw_read(self.root_dir_start_byte, &mut buf)?;
            Ok(buf)
        }
    }

    fn read_cluster_chain_bytes(&mut self, first: u32) -> WfsResult<Vec<u8>> {
        let chain = self.cluster_chain(first)?;
        let clus_size = self.cluster_size() as usize;
        let mut out = Vec::with_capacity(chain.len() * clus_size);
        for c in chain {
            let off = self.cluster_offset(c);
            let mut buf = vec![0u8; clus_size];
            self.raw_read(off, &mut buf)?;
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }
}

fn first_cluster_of(slot: &[u8], variant: FatVariant) -> u32 {
    let lo = u16::from_le_bytes([slot[26], slot[27]]) as u32;
    if variant == FatVariant::Fat32 {
        let hi = u16::from_le_bytes([slot[20], slot[21]]) as u32;
        (hi << 16) | lo
    } else {
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_rejects_buffer_without_signature() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 512]).unwrap();
        assert!(!probe(f.path()).unwrap());
    }

    #[test]
    fn deleted_marker_is_recognized() {
        let mut slot = [0u8; 32];
        slot[0] = 0xE5;
        assert_eq!(slot[0], 0xE5);
    }
}
