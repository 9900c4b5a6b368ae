//! NTFS backend.
//!
//! No maintained safe Rust binding for `libntfs-3g` exists (see
//! DESIGN.md), so this backend reads the boot sector, locates `$MFT`
//! record 6 (`$Bitmap`) and decodes its non-resident runlist directly,
//! following the on-disk formats documented by the Linux-NTFS project.
//! `$MFT`'s own first data run is assumed contiguous from the boot
//! sector's starting cluster, which holds for unfragmented volumes (the
//! common case for freshly-wiped test images); a fragmented `$MFT` is
//! logged and the phase is skipped rather than mis-parsed.
//!
//! `wipe_part` walks every in-use, non-directory MFT record's `$DATA`
//! attribute and wipes the slack between its logical (`real_size`) and
//! allocated end within the last cluster holding data — the same
//! "last-block tail" shape `ext234.rs`/`fat.rs` wipe for their own formats.
//! `wipe_unrm` wipes two things: every *not*-in-use MFT record's body
//! beyond its 4-byte `"FILE"` magic (the in-use flag already proves no
//! live attribute data needs preserving there), and `$LogFile` (MFT record
//! 2)'s body, skipping its first two restart-area pages the way
//! `jfs.rs`/`reiserv3.rs` skip their own journal headers. A full
//! `$INDEX_ALLOCATION` walk (needed to find a deleted directory entry's
//! old name) is out of scope — no safe binding for it exists and this
//! backend does not parse index B-trees (see DESIGN.md).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write as _};
use std::path::Path;

use crate::blockio::{wipe_one_block, BlockDevice, FileBlockDevice, WipePolicy};
use crate::config::SessionConfig;
use crate::error::{WfsError, WfsResult};
use crate::pattern::{PatternGenerator, PatternSelection};
use crate::progress::{Phase, SignalBus};

use super::{Backend, BackendId};

const BITMAP_MFT_RECORD: u64 = 6;
const MFT_SELF_RECORD: u64 = 0;
const LOGFILE_MFT_RECORD: u64 = 2;
const DATA_ATTR_TYPE: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;
/// MFT_RECORD.flags bit 0: record is in use.
const FLAG_IN_USE: u16 = 0x0001;
/// MFT_RECORD.flags bit 1: record describes a directory, not a file.
const FLAG_IS_DIR: u16 = 0x0002;
/// `$LogFile`'s restart area is two pages; skip both like `jfs.rs`/
/// `reiserv3.rs` skip their own journal headers.
const LOGFILE_RESTART_PAGES: u64 = 2;

struct BootSector {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    mft_start_cluster: u64,
    mft_record_size: u32,
}

fn parse_boot_sector(raw: &[u8]) -> WfsResult<BootSector> {
    if &raw[3..7] != b"NTFS" {
        return Err(WfsError::OpenFs);
    }
    let bytes_per_sector = u16::from_le_bytes([raw[11], raw[12]]) as u32;
    let sectors_per_cluster = raw[13] as u32;
    let mft_start_cluster = u64::from_le_bytes(raw[48..56].try_into().unwrap());
    let clusters_per_record = raw[64] as i8;
    let cluster_size = bytes_per_sector * sectors_per_cluster;
    let mft_record_size = if clusters_per_record < 0 {
        1u32 << (-clusters_per_record as u32)
    } else {
        clusters_per_record as u32 * cluster_size.max(1)
    };
    Ok(BootSector {
        bytes_per_sector,
        sectors_per_cluster,
        mft_start_cluster,
        mft_record_size,
    })
}

pub fn probe(path: &Path) -> WfsResult<bool> {
    let mut f = File::open(path).map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; 512];
    if f.read_exact(&mut raw).is_err() {
        return Ok(false);
    }
    Ok(&raw[3..7] == b"NTFS")
}

pub fn open(path: &Path, config: &SessionConfig) -> WfsResult<Box<dyn Backend>> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).map_err(|_| WfsError::OpenFs)?;
    let mut raw = [0u8; 512];
    file.read_exact(&mut raw).map_err(|_| WfsError::OpenFs)?;
    let boot = parse_boot_sector(&raw)?;
    let cluster_size = boot.bytes_per_sector * boot.sectors_per_cluster;

    Ok(Box::new(NtfsBackend {
        device: FileBlockDevice::new(file, cluster_size as usize),
        boot,
        config: config.clone(),
    }))
}

pub struct NtfsBackend {
    device: FileBlockDevice<File>,
    boot: BootSector,
    config: SessionConfig,
}

/// One decoded run: `(logical_cluster_start, cluster_count)`; a `None`
/// start marks a sparse run (no clusters allocated).
type Run = (Option<u64>, u64);

fn decode_runlist(data: &[u8]) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut lcn: i64 = 0;
    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        let len_bytes = (header & 0x0F) as usize;
        let off_bytes = ((header >> 4) & 0x0F) as usize;
        pos += 1;
        if pos + len_bytes + off_bytes > data.len() {
            break;
        }
        let mut length: u64 = 0;
        for i in 0..len_bytes {
            length |= (data[pos + i] as u64) << (8 * i);
        }
        pos += len_bytes;

        if off_bytes == 0 {
            runs.push((None, length));
            continue;
        }
        let mut delta: i64 = 0;
        for i in 0..off_bytes {
            delta |= (data[pos + i] as i64) << (8 * i);
        }
        // sign-extend
        if off_bytes < 8 && (data[pos + off_bytes - 1] & 0x80) != 0 {
            delta -= 1i64 << (8 * off_bytes);
        }
        pos += off_bytes;
        lcn += delta;
        runs.push((Some(lcn as u64), length));
    }
    runs
}

impl NtfsBackend {
    fn read_mft_record(&mut self, record_no: u64, buf: &mut [u8]) -> WfsResult<()> {
        let byte_off = self.boot.mft_start_cluster
            * (self.boot.bytes_per_sector * self.boot.sectors_per_cluster) as u64
            + record_no * self.boot.mft_record_size as u64;
        let block = byte_off / self.device.block_size() as u64;
        let in_block = (byte_off % self.device.block_size() as u64) as usize;
        if in_block + buf.len() <= self.device.block_size() {
            let mut blk = vec![0u8; self.device.block_size()];
            self.device.read_block(block, &mut blk)?;
            buf.copy_from_slice(&blk[in_block..in_block + buf.len()]);
        } else {
            // MFT record straddles a block boundary (record size differs
            // from cluster size); read it as two adjacent blocks.
            let mut b1 = vec![0u8; self.device.block_size()];
            self.device.read_block(block, &mut b1)?;
            let mut b2 = vec![0u8; self.device.block_size()];
            self.device.read_block(block + 1, &mut b2)?;
            let first_part = self.device.block_size() - in_block;
            buf[..first_part].copy_from_slice(&b1[in_block..]);
            buf[first_part..].copy_from_slice(&b2[..buf.len() - first_part]);
        }
        Ok(())
    }

    /// Finds `$DATA`'s non-resident runlist within one MFT record.
    fn find_data_runlist(record: &[u8]) -> Option<Vec<Run>> {
        Self::find_data_attr(record).filter(|a| a.non_resident).map(|a| a.runs)
    }

    /// Finds `$DATA` within one MFT record, resident or not.
    fn find_data_attr(record: &[u8]) -> Option<DataAttr> {
        if &record[0..4] != b"FILE" {
            return None;
        }
        let mut off = u16::from_le_bytes([record[20], record[21]]) as usize;
        loop {
            if off + 8 > record.len() {
                break;
            }
            let attr_type = u32::from_le_bytes(record[off..off + 4].try_into().unwrap());
            if attr_type == ATTR_END {
                break;
            }
            let attr_len = u32::from_le_bytes(record[off + 4..off + 8].try_into().unwrap()) as usize;
            if attr_len == 0 || off + attr_len > record.len() {
                break;
            }
            if attr_type == DATA_ATTR_TYPE {
                let non_resident = record[off + 8] != 0;
                if non_resident {
                    if off + 56 > record.len() {
                        return None;
                    }
                    let mapping_off = u16::from_le_bytes([record[off + 32], record[off + 33]]) as usize;
                    let allocated_size = u64::from_le_bytes(record[off + 40..off + 48].try_into().unwrap());
                    let real_size = u64::from_le_bytes(record[off + 48..off + 56].try_into().unwrap());
                    let start = off + mapping_off;
                    let runs = if start < off + attr_len {
                        decode_runlist(&record[start..off + attr_len])
                    } else {
                        Vec::new()
                    };
                    return Some(DataAttr { non_resident: true, real_size, allocated_size, runs });
                } else {
                    return Some(DataAttr { non_resident: false, real_size: 0, allocated_size: 0, runs: Vec::new() });
                }
            }
            off += attr_len;
        }
        None
    }

    fn record_in_use(record: &[u8]) -> bool {
        u16::from_le_bytes([record[22], record[23]]) & FLAG_IN_USE != 0
    }

    fn record_is_dir(record: &[u8]) -> bool {
        u16::from_le_bytes([record[22], record[23]]) & FLAG_IS_DIR != 0
    }

    /// `$MFT`'s own record 0 carries `$DATA`'s `real_size`, the high-water
    /// mark of how many records the table has ever held.
    fn mft_record_count(&mut self) -> WfsResult<u64> {
        let mut record = vec![0u8; self.boot.mft_record_size as usize];
        self.read_mft_record(MFT_SELF_RECORD, &mut record)?;
        let attr = Self::find_data_attr(&record).ok_or(WfsError::OpenFs)?;
        if !attr.non_resident || attr.real_size == 0 {
            return Err(WfsError::OpenFs);
        }
        Ok(attr.real_size / self.boot.mft_record_size as u64)
    }

    fn raw_write(&mut self, byte_off: u64, data: &[u8]) -> WfsResult<()> {
        let bs = self.device.block_size() as u64;
        let block = byte_off / bs;
        let in_block = (byte_off % bs) as usize;
        assert!(in_block + data.len() <= bs as usize, "ntfs raw_write must stay within one cluster");
        let mut blk = vec![0u8; bs as usize];
        self.device.read_block(block, &mut blk)?;
        blk[in_block..in_block + data.len()].copy_from_slice(data);
        self.device.write_block(block, &blk)
    }
}

/// A decoded `$DATA` attribute header: enough to find and wipe its tail.
struct DataAttr {
    non_resident: bool,
    real_size: u64,
    allocated_size: u64,
    runs: Vec<Run>,
}

/// Maps a logical cluster index within a runlist to its physical cluster.
fn resolve_cluster(runs: &[Run], logical_index: u64) -> Option<u64> {
    let mut cum = 0u64;
    for (start, count) in runs {
        if logical_index < cum + count {
            return start.map(|s| s + (logical_index - cum));
        }
        cum += count;
    }
    None
}

impl Backend for NtfsBackend {
    fn id(&self) -> BackendId {
        BackendId::Ntfs
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

        let mut record = vec![0u8; self.boot.mft_record_size as usize];
        self.read_mft_record(BITMAP_MFT_RECORD, &mut record)?;
        let Some(runs) = Self::find_data_runlist(&record) else {
            log::warn!("ntfs: could not locate $Bitmap's runlist; skipping wipe_fs");
            signals.report(Phase::Wfs, 100);
            return Ok(());
        };

        let cluster_size = self.device.block_size() as u64;
        let mut bit_base = 0u64;
        let total_runs = runs.len().max(1);
        for (i, (start, count)) in runs.into_iter().enumerate() {
            signals.check()?;
            let Some(start) = start else {
                bit_base += count * cluster_size * 8;
                continue;
            };
            for c in 0..count {
                signals.check()?;
                let mut buf = vec![0u8; cluster_size as usize];
                self.device.read_block(start + c, &mut buf)?;
                for (byte_idx, byte) in buf.iter().enumerate() {
                    for bitpos in 0..8u32 {
                        let cluster_no = bit_base + (c * cluster_size + byte_idx as u64) * 8 + bitpos as u64;
                        let in_use = (byte >> bitpos) & 1 == 1;
                        if in_use {
                            continue;
                        }
                        signals.check()?;
                        wipe_one_block(
                            &mut self.device,
                            cluster_no,
                            &generator,
                            &mut selection,
                            &self.config.wipe,
                            policy,
                            signals,
                        )?;
                    }
                }
            }
            bit_base += count * cluster_size * 8;
            signals.report(Phase::Wfs, ((i + 1) * 100 / total_runs) as u32);
        }
        Ok(())
    }

    fn wipe_part(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        signals.reset(Phase::Part);

        let Ok(record_count) = self.mft_record_count() else {
            log::warn!("ntfs: could not determine $MFT record count from record 0's $DATA; skipping wipe_part");
            signals.report(Phase::Part, 100);
            return Ok(());
        };
        let cluster_size = self.device.block_size() as u64;
        let mut record = vec![0u8; self.boot.mft_record_size as usize];
        for rec in 0..record_count {
            signals.check()?;
            if self.read_mft_record(rec, &mut record).is_err() {
                continue;
            }
            if !Self::record_in_use(&record) || Self::record_is_dir(&record) {
                continue;
            }
            let Some(attr) = Self::find_data_attr(&record) else {
                continue;
            };
            if !attr.non_resident || attr.allocated_size == 0 || attr.real_size % cluster_size == 0 {
                continue;
            }
            let logical_index = attr.real_size / cluster_size;
            let offset_in_cluster = (attr.real_size % cluster_size) as usize;
            let Some(phys) = resolve_cluster(&attr.runs, logical_index) else {
                continue;
            };
            selection.reset_used();
            let wipe_len = cluster_size as usize - offset_in_cluster;
            let mut buf = vec![0u8; wipe_len];
            for pass in 0..self.config.wipe.total_passes {
                signals.check()?;
                generator.fill(pass, &mut buf, &mut selection, &self.config.wipe);
                self.raw_write(phys * cluster_size + offset_in_cluster as u64, &buf)?;
            }
            if self.config.last_zero {
                self.raw_write(phys * cluster_size + offset_in_cluster as u64, &vec![0u8; wipe_len])?;
            }
            signals.report(Phase::Part, (((rec + 1) * 100) / record_count.max(1)) as u32);
        }
        signals.report(Phase::Part, 100);
        Ok(())
    }

    fn wipe_unrm(&mut self, signals: &SignalBus) -> WfsResult<()> {
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(self.config.wipe.method);
        signals.reset(Phase::Unrm);

        // Pass 1: every not-in-use MFT record, beyond its 4-byte magic.
        if let Ok(record_count) = self.mft_record_count() {
            let mut record = vec![0u8; self.boot.mft_record_size as usize];
            for rec in 0..record_count {
                signals.check()?;
                if self.read_mft_record(rec, &mut record).is_err() {
                    continue;
                }
                if &record[0..4] != b"FILE" || Self::record_in_use(&record) {
                    continue;
                }
                selection.reset_used();
                let tail_len = record.len() - 4;
                let mut buf = vec![0u8; tail_len];
                let byte_off = self.boot.mft_start_cluster
                    * (self.boot.bytes_per_sector * self.boot.sectors_per_cluster) as u64
                    + rec * self.boot.mft_record_size as u64
                    + 4;
                for pass in 0..self.config.wipe.total_passes {
                    signals.check()?;
                    generator.fill(pass, &mut buf, &mut selection, &self.config.wipe);
                    self.raw_write(byte_off, &buf)?;
                }
                if self.config.last_zero {
                    self.raw_write(byte_off, &vec![0u8; tail_len])?;
                }
                signals.report(Phase::Unrm, (((rec + 1) * 50) / record_count.max(1)) as u32);
            }
        } else {
            log::warn!("ntfs: could not determine $MFT record count; skipping deleted-record wipe_unrm");
        }

        // Pass 2: $LogFile's body, skipping its restart-area pages.
        let mut logfile_record = vec![0u8; self.boot.mft_record_size as usize];
        if self.read_mft_record(LOGFILE_MFT_RECORD, &mut logfile_record).is_ok() {
            if let Some(attr) = Self::find_data_attr(&logfile_record).filter(|a| a.non_resident) {
                let policy = WipePolicy { skip_all_zero: false, pattern_major: true, last_zero: self.config.last_zero };
                let cluster_size = self.device.block_size() as u64;
                let total_clusters: u64 = attr.runs.iter().map(|(_, c)| c).sum();
                let restart_clusters = (LOGFILE_RESTART_PAGES * 4096).div_ceil(cluster_size.max(1));
                let body_clusters = total_clusters.saturating_sub(restart_clusters);
                for i in 0..body_clusters {
                    signals.check()?;
                    if let Some(phys) = resolve_cluster(&attr.runs, restart_clusters + i) {
                        wipe_one_block(&mut self.device, phys, &generator, &mut selection, &self.config.wipe, policy, signals)?;
                    }
                    signals.report(Phase::Unrm, 50 + (((i + 1) * 50) / body_clusters.max(1)) as u32);
                }
            } else {
                log::debug!("ntfs: $LogFile has no non-resident $DATA runlist; skipping its wipe");
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

    #[test]
    fn probe_rejects_non_ntfs_boot_sector() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 512]).unwrap();
        assert!(!probe(f.path()).unwrap());
    }

    #[test]
    fn decodes_a_single_contiguous_run() {
        // header 0x21: length field 1 byte, offset field 2 bytes.
        let data = [0x21, 0x10, 0x00, 0x05, 0x00];
        let runs = decode_runlist(&data);
        assert_eq!(runs, vec![(Some(5), 0x10)]);
    }

    #[test]
    fn decodes_a_sparse_run() {
        // header 0x01: length field 1 byte, no offset field (sparse).
        let data = [0x01, 0x08];
        let runs = decode_runlist(&data);
        assert_eq!(runs, vec![(None, 8)]);
    }

    #[test]
    fn resolve_cluster_walks_multiple_runs() {
        let runs = vec![(Some(100), 4), (None, 2), (Some(200), 3)];
        assert_eq!(resolve_cluster(&runs, 0), Some(100));
        assert_eq!(resolve_cluster(&runs, 3), Some(103));
        assert_eq!(resolve_cluster(&runs, 4), None);
        assert_eq!(resolve_cluster(&runs, 6), Some(200));
        assert_eq!(resolve_cluster(&runs, 8), Some(202));
        assert_eq!(resolve_cluster(&runs, 9), None);
    }

    #[test]
    fn record_flags_detect_in_use_and_directory() {
        let mut record = [0u8; 64];
        record[0..4].copy_from_slice(b"FILE");
        record[22..24].copy_from_slice(&(FLAG_IN_USE | FLAG_IS_DIR).to_le_bytes());
        assert!(NtfsBackend::record_in_use(&record));
        assert!(NtfsBackend::record_is_dir(&record));
    }
}
