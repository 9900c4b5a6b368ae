//! Session configuration, built once by the CLI and passed by reference to
//! the Dispatcher and every backend. Plain data; never re-parsed.

use crate::pattern::{SessionWipeConfig, WipeMethod};

/// Which wiping phases to run, per `--nopart`/`--nounrm`/`--nowfs`.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSelection {
    pub unrm: bool,
    pub part: bool,
    pub wfs: bool,
}

impl PhaseSelection {
    pub fn any(&self) -> bool {
        self.unrm || self.part || self.wfs
    }
}

/// Configuration carried on `FsHandle` for the lifetime of one device.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub wipe: SessionWipeConfig,
    pub last_zero: bool,
    pub phases: PhaseSelection,
    pub skip_all_zero_blocks: bool,
    pub force: bool,
    pub superblock_offset: u64,
    pub block_size_override: u64,
    pub use_ioctl: bool,
    pub use_dedicated: bool,
    pub verbose: u8,
}

/// All the raw CLI knobs needed to build a `SessionConfig`, so the
/// constructor does not take a dozen positional arguments.
#[derive(Debug, Clone)]
pub struct SessionConfigArgs {
    pub method: WipeMethod,
    pub iterations: u64,
    pub all_zeros: bool,
    pub last_zero: bool,
    pub phases: PhaseSelection,
    pub skip_all_zero_blocks: bool,
    pub force: bool,
    pub superblock_offset: u64,
    pub block_size_override: u64,
    pub use_ioctl: bool,
    pub use_dedicated: bool,
    pub verbose: u8,
}

impl SessionConfig {
    /// Resolves `-n 0` (method default) and validates at least one phase is
    /// selected, matching spec.md §6's CLI contract. Returns `None` if no
    /// phase remains selected.
    pub fn new(args: SessionConfigArgs) -> Option<Self> {
        if !args.phases.any() {
            return None;
        }
        let total_passes = if args.iterations == 0 {
            args.method.default_pass_count()
        } else {
            args.iterations
        };
        Some(SessionConfig {
            wipe: SessionWipeConfig {
                method: args.method,
                total_passes,
                all_zeros: args.all_zeros,
            },
            last_zero: args.last_zero,
            phases: args.phases,
            skip_all_zero_blocks: args.skip_all_zero_blocks,
            force: args.force,
            superblock_offset: args.superblock_offset,
            block_size_override: args.block_size_override,
            use_ioctl: args.use_ioctl,
            use_dedicated: args.use_dedicated,
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> SessionConfigArgs {
        SessionConfigArgs {
            method: WipeMethod::Dod,
            iterations: 0,
            all_zeros: false,
            last_zero: false,
            phases: PhaseSelection {
                unrm: true,
                part: true,
                wfs: true,
            },
            skip_all_zero_blocks: false,
            force: false,
            superblock_offset: 0,
            block_size_override: 0,
            use_ioctl: false,
            use_dedicated: false,
            verbose: 0,
        }
    }

    #[test]
    fn no_phases_selected_is_rejected() {
        let mut args = base_args();
        args.phases = PhaseSelection {
            unrm: false,
            part: false,
            wfs: false,
        };
        assert!(SessionConfig::new(args).is_none());
    }

    #[test]
    fn zero_iterations_resolves_to_method_default() {
        let cfg = SessionConfig::new(base_args()).unwrap();
        assert_eq!(cfg.wipe.total_passes, WipeMethod::Dod.default_pass_count());
    }
}
