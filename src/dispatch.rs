//! Dispatcher (C7): probes backends in a fixed order, then drives the
//! Phase Sequence of spec.md §4.7 for one device.
//!
//! Grounded on `original_source/src/wipefreespace.c`'s `wfs_clean_fs` main
//! loop and, for the child-process isolation around Reiser3/MinixFS, on
//! `nix::unistd::fork` used the way `cberner-fuser`'s `mnt/mount_options.rs`
//! daemonizes via raw `fork`/`waitpid`.

use std::path::{Path, PathBuf};

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

use crate::backend::{probe_and_open, BackendId, FsHandle};
use crate::cache::CacheTable;
use crate::config::SessionConfig;
use crate::error::{WfsError, WfsResult};
use crate::mount::{check_mount, MountState};
use crate::progress::{Phase, SignalBus};

pub struct Dispatcher {
    cache: CacheTable,
    signals: SignalBus,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            cache: CacheTable::new(),
            signals: SignalBus::new(),
        }
    }

    /// Processes every device in turn, returning the first error seen (if
    /// any) after attempting the rest — matching spec.md §7's "continue to
    /// the next device" rule.
    pub fn run(&self, devices: &[PathBuf], config: &SessionConfig) -> Option<WfsError> {
        let mut first_error = None;
        for dev in devices {
            if let Err(e) = self.process_device(dev, config) {
                log::error!("{}", crate::error::format_failure_line("wipefreespace", dev, &e, "processing device"));
                let fatal = matches!(e, WfsError::Signal(_));
                if first_error.is_none() {
                    first_error = Some(e);
                }
                if fatal {
                    break;
                }
            }
        }
        first_error
    }

    /// Drives one device through the full phase sequence, isolating the
    /// backend in a child process first when `BackendId::needs_process_isolation`
    /// says so.
    pub fn process_device(&self, dev: &Path, config: &SessionConfig) -> WfsResult<()> {
        match check_mount(dev)? {
            MountState::MountedRw => return Err(WfsError::MntRw),
            MountState::MountedRo | MountState::Unmounted => {}
        }

        if config.use_ioctl {
            self.cache.disable(dev);
        }
        let result = self.run_backend_phases(dev, config);
        if config.use_ioctl {
            self.cache.enable(dev);
        }
        result
    }

    fn run_backend_phases(&self, dev: &Path, config: &SessionConfig) -> WfsResult<()> {
        let Some(id) = self.probe_all(dev) else {
            return Err(WfsError::OpenFs);
        };

        if id.needs_process_isolation() {
            return self.run_in_child(dev, config, id);
        }
        self.drive(dev, config, id)
    }

    fn probe_all(&self, dev: &Path) -> Option<BackendId> {
        for id in BackendId::PROBE_ORDER {
            let (probe, _) = probe_and_open(id);
            if probe(dev).unwrap_or(false) {
                return Some(id);
            }
        }
        None
    }

    /// Opens the backend and runs the phase sequence in this process.
    fn drive(&self, dev: &Path, config: &SessionConfig, id: BackendId) -> WfsResult<()> {
        let (_, open) = probe_and_open(id);
        let backend = open(dev, config)?;
        let mut handle = FsHandle::new(dev.to_path_buf(), backend, config.clone());
        log::debug!("dispatch: driving {} as {:?}", handle.device_path.display(), handle.which_fs);

        if handle.backend.check_err() && !handle.config.force {
            return Err(WfsError::FsHasError);
        }
        handle.backend.flush()?;

        let mut first_phase_error = None;
        if handle.config.phases.unrm {
            self.signals.reset(Phase::Unrm);
            if let Err(e) = handle.backend.wipe_unrm(&self.signals) {
                if matches!(e, WfsError::Signal(_)) {
                    return Err(e);
                }
                first_phase_error.get_or_insert(e);
            }
        }
        if handle.config.phases.part {
            self.signals.reset(Phase::Part);
            if let Err(e) = handle.backend.wipe_part(&self.signals) {
                if matches!(e, WfsError::Signal(_)) {
                    return Err(e);
                }
                first_phase_error.get_or_insert(e);
            }
        }
        if handle.config.phases.wfs {
            self.signals.reset(Phase::Wfs);
            if let Err(e) = handle.backend.wipe_fs(&self.signals) {
                if matches!(e, WfsError::Signal(_)) {
                    return Err(e);
                }
                first_phase_error.get_or_insert(e);
            }
        }

        handle.backend.flush()?;
        handle.backend.close()?;

        match first_phase_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs `drive` in a forked child so a native-library `abort()`/`exit()`
    /// inside Reiser3/MinixFS only poisons this one device (spec.md §4.7
    /// point 11). The child's `WfsError` is communicated back as its exit
    /// status via `WfsError::code`; success is status 0.
    fn run_in_child(&self, dev: &Path, config: &SessionConfig, id: BackendId) -> WfsResult<()> {
        // Safety: the child immediately either calls `drive` (pure Rust,
        // no unsafe preconditions violated by fork) or `std::process::exit`.
        match unsafe { fork() }.map_err(WfsError::ForkErr)? {
            ForkResult::Child => {
                let code = match self.drive(dev, config, id) {
                    Ok(()) => 0,
                    Err(e) => e.code(),
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, 0)) => Ok(()),
                Ok(WaitStatus::Exited(_, code)) => Err(WfsError::ExecErr(format!(
                    "isolated backend for {} exited with code {}",
                    dev.display(),
                    code
                ))),
                Ok(WaitStatus::Signaled(_, sig, _)) => Err(WfsError::ExecErr(format!(
                    "isolated backend for {} was killed by signal {:?}",
                    dev.display(),
                    sig
                ))),
                Ok(_) => Err(WfsError::ExecErr(format!(
                    "isolated backend for {} exited abnormally",
                    dev.display()
                ))),
                Err(e) => Err(WfsError::ForkErr(e)),
            },
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::WipeMethod;
    use std::io::Write;

    fn base_config() -> SessionConfig {
        SessionConfig::new(crate::config::SessionConfigArgs {
            method: WipeMethod::Dod,
            iterations: 1,
            all_zeros: false,
            last_zero: false,
            phases: crate::config::PhaseSelection {
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
        })
        .unwrap()
    }

    #[test]
    fn unrecognized_image_fails_to_open() {
        let dispatcher = Dispatcher::new();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 4096]).unwrap();
        let config = base_config();
        let err = dispatcher.process_device(f.path(), &config).unwrap_err();
        assert!(matches!(err, WfsError::OpenFs));
    }
}
