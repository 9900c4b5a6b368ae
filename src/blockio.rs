//! Block Buffer I/O (C2).
//!
//! A small trait seam that every backend reads/writes a block through, plus
//! the shared per-block sub-state machine (`ZeroCheck -> (Fill -> Write ->
//! Flush) x N -> FinalZero? -> End`) described in spec.md §4.6.

use crate::error::{WfsError, WfsResult};
use crate::pattern::{PatternGenerator, PatternSelection, SessionWipeConfig};
use crate::progress::SignalBus;
use std::io::{Read, Seek, SeekFrom, Write};

/// One absolute block number, native to whatever unit the backend uses
/// (filesystem block for most backends, cluster for FAT).
pub type BlockNr = u64;

/// Abstraction over "a device we can read/write fixed-size blocks on".
/// Implemented for `std::fs::File` in production; test fakes implement it
/// over an in-memory buffer.
pub trait BlockDevice {
    fn block_size(&self) -> usize;

    /// Reads one block into `buf` (`buf.len()` must equal `block_size()`).
    fn read_block(&mut self, blocknr: BlockNr, buf: &mut [u8]) -> WfsResult<()>;

    /// Writes one block. Errors on blocks in `bad_blocks` are swallowed by
    /// the caller, not by the implementation.
    fn write_block(&mut self, blocknr: BlockNr, buf: &[u8]) -> WfsResult<()>;

    fn flush(&mut self) -> WfsResult<()>;
}

/// A `BlockDevice` backed by a plain file/block device node, addressed by
/// absolute byte offset `blocknr * block_size`.
pub struct FileBlockDevice<F> {
    file: F,
    block_size: usize,
}

impl<F: Read + Write + Seek> FileBlockDevice<F> {
    pub fn new(file: F, block_size: usize) -> Self {
        FileBlockDevice { file, block_size }
    }

    pub fn into_inner(self) -> F {
        self.file
    }
}

impl<F: Read + Write + Seek> BlockDevice for FileBlockDevice<F> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, blocknr: BlockNr, buf: &mut [u8]) -> WfsResult<()> {
        self.file
            .seek(SeekFrom::Start(blocknr * self.block_size as u64))
            .map_err(WfsError::SeekErr)?;
        self.file
            .read_exact(buf)
            .map_err(|_| WfsError::BlkRd(blocknr))
    }

    fn write_block(&mut self, blocknr: BlockNr, buf: &[u8]) -> WfsResult<()> {
        self.file
            .seek(SeekFrom::Start(blocknr * self.block_size as u64))
            .map_err(WfsError::SeekErr)?;
        self.file
            .write_all(buf)
            .map_err(|_| WfsError::BlkWr(blocknr))
    }

    fn flush(&mut self) -> WfsResult<()> {
        self.file.flush().map_err(WfsError::FlushFs)
    }
}

/// Policy knobs shared by every backend's block-wiping loop.
#[derive(Debug, Clone, Copy)]
pub struct WipePolicy {
    pub skip_all_zero: bool,
    /// "pattern-major": flush after every pass j > 0. "block-major": flush
    /// after every pass when N > 1. A single-pass session never flushes
    /// between writes, to allow OS buffering.
    pub pattern_major: bool,
    pub last_zero: bool,
}

/// Runs the full N-pass (+ optional final zero) sub-state machine for one
/// block, per spec.md §4.2 and the `Start -> [ZeroCheck] -> [Fill -> Write
/// -> Flush] x N -> [FinalZero?] -> End` state machine of §4.6.
///
/// Returns `Ok(true)` if the block was (or would have been) written at
/// least once, `Ok(false)` if it was skipped entirely (all-zero
/// short-circuit), and propagates the first write/flush error otherwise.
/// A bad-listed block's write error is swallowed by the caller inspecting
/// `bad_blocks`, not here; this function always reports the error upward.
pub fn wipe_one_block(
    dev: &mut dyn BlockDevice,
    blocknr: BlockNr,
    generator: &PatternGenerator,
    selection: &mut PatternSelection,
    session: &SessionWipeConfig,
    policy: WipePolicy,
    signals: &SignalBus,
) -> WfsResult<bool> {
    let bs = dev.block_size();
    let mut buf = vec![0u8; bs];
    selection.reset_used();

    if policy.skip_all_zero {
        dev.read_block(blocknr, &mut buf)?;
        if buf.iter().all(|&b| b == 0) {
            return Ok(false);
        }
    }

    let passes = session.total_passes;
    for pass in 0..passes {
        signals.check()?;
        generator.fill(pass, &mut buf, selection, session);
        dev.write_block(blocknr, &buf)?;
        if policy.pattern_major && pass > 0 {
            dev.flush()?;
        } else if !policy.pattern_major && passes > 1 {
            dev.flush()?;
        }
    }

    if policy.last_zero {
        signals.check()?;
        buf.iter_mut().for_each(|b| *b = 0);
        dev.write_block(blocknr, &buf)?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::WipeMethod;
    use crate::progress::SignalBus;
    use std::io::Cursor;

    fn fake_device(block_size: usize, blocks: usize) -> FileBlockDevice<Cursor<Vec<u8>>> {
        FileBlockDevice::new(Cursor::new(vec![0xAAu8; block_size * blocks]), block_size)
    }

    #[test]
    fn zero_block_is_skipped_when_policy_enabled() {
        let mut dev = FileBlockDevice::new(Cursor::new(vec![0u8; 512]), 512);
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(WipeMethod::Dod);
        let session = SessionWipeConfig {
            method: WipeMethod::Dod,
            total_passes: 3,
            all_zeros: false,
        };
        let policy = WipePolicy {
            skip_all_zero: true,
            pattern_major: true,
            last_zero: false,
        };
        let signals = SignalBus::new_for_test();
        let written = wipe_one_block(&mut dev, 0, &generator, &mut selection, &session, policy, &signals)
            .unwrap();
        assert!(!written);
    }

    #[test]
    fn non_zero_block_gets_all_passes_plus_final_zero() {
        let mut dev = fake_device(16, 1);
        let generator = PatternGenerator::new();
        let mut selection = PatternSelection::new(WipeMethod::Dod);
        let session = SessionWipeConfig {
            method: WipeMethod::Dod,
            total_passes: 1,
            all_zeros: false,
        };
        let policy = WipePolicy {
            skip_all_zero: false,
            pattern_major: true,
            last_zero: true,
        };
        let signals = SignalBus::new_for_test();
        let written = wipe_one_block(&mut dev, 0, &generator, &mut selection, &session, policy, &signals)
            .unwrap();
        assert!(written);
        let mut buf = [0u8; 16];
        dev.read_block(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
