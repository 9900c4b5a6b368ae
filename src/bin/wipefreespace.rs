//! `wipefreespace` CLI: wipes free blocks, file slack and deleted-file
//! metadata on one or more filesystem images or block devices.
//!
//! Option names and defaults are grounded on `original_source/src/wipefreespace.c`'s
//! getopt table; the `clap::Parser` derive style mirrors
//! `examples/common/args.rs`'s `CommonArgs`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use secwipe::config::{PhaseSelection, SessionConfig, SessionConfigArgs};
use secwipe::dispatch::Dispatcher;
use secwipe::error::format_failure_line;
use secwipe::pattern::WipeMethod;
use secwipe::progress::install_signal_handler;

#[derive(Parser)]
#[command(name = "wipefreespace", version, about = "Securely wipe free space, file slack and deleted-file metadata")]
struct Cli {
    /// Device(s) or filesystem image(s) to wipe.
    devices: Vec<PathBuf>,

    /// Number of passes (0 = method default).
    #[arg(short = 'n', long = "iterations", default_value_t = 0)]
    iterations: u64,

    /// Pattern selection method.
    #[arg(long = "method", default_value = "gutmann")]
    method: String,

    /// Force every pattern to zero.
    #[arg(long = "all-zeros")]
    all_zeros: bool,

    /// Append a final all-zero pass.
    #[arg(long = "last-zero")]
    last_zero: bool,

    /// Read each block first and skip it if already all-zero.
    #[arg(long = "no-wipe-zero-blocks")]
    no_wipe_zero_blocks: bool,

    /// Skip the file-slack phase.
    #[arg(long = "nopart")]
    nopart: bool,

    /// Skip the deleted-metadata phase.
    #[arg(long = "nounrm")]
    nounrm: bool,

    /// Skip the free-space phase.
    #[arg(long = "nowfs")]
    nowfs: bool,

    /// Wipe even if the filesystem reports consistency errors.
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Superblock offset passed to the backend's `open`.
    #[arg(short = 'b', long = "superblock", default_value_t = 0)]
    superblock: u64,

    /// Block size passed to the backend's `open` (0 = autodetect).
    #[arg(short = 'B', long = "blocksize", default_value_t = 0)]
    blocksize: u64,

    /// Use ioctls to disable/re-enable the device write cache.
    #[arg(long = "use-ioctl")]
    use_ioctl: bool,

    /// Prefer external tools (e.g. `xfs_db`) over a library even where one
    /// is available.
    #[arg(long = "use-dedicated")]
    use_dedicated: bool,

    /// Increase verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the program's license and exit.
    #[arg(short = 'l', long = "license")]
    license: bool,
}

/// `original_source/src/wipefreespace.c`'s `lic_str`/`author_str`, printed
/// verbatim by `-l`/`--license`.
const LICENSE_TEXT: &str = "\
Program for secure cleaning of free space on filesystems.

This program is Free Software; you can redistribute it and/or
modify it under the terms of the GNU General Public License
as published by the Free Software Foundation; either version 2
of the License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.

Copyright (C) 2007-2024 Bogdan 'bogdro' Drozdowski, bogdro@users.sourceforge.net";

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.license {
        println!("{}", LICENSE_TEXT);
        return ExitCode::SUCCESS;
    }
    if cli.devices.is_empty() {
        eprintln!("wipefreespace: at least one device or filesystem image is required");
        return ExitCode::from(2);
    }

    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    let Some(method) = WipeMethod::parse(&cli.method) else {
        eprintln!("wipefreespace: unknown wiping method '{}'", cli.method);
        return ExitCode::from(2);
    };

    let phases = PhaseSelection {
        unrm: !cli.nounrm,
        part: !cli.nopart,
        wfs: !cli.nowfs,
    };
    if !phases.any() {
        eprintln!("wipefreespace: at least one of unrm/part/wfs must remain enabled");
        return ExitCode::from(1);
    }

    let Some(config) = SessionConfig::new(SessionConfigArgs {
        method,
        iterations: cli.iterations,
        all_zeros: cli.all_zeros,
        last_zero: cli.last_zero,
        phases,
        skip_all_zero_blocks: cli.no_wipe_zero_blocks,
        force: cli.force,
        superblock_offset: cli.superblock,
        block_size_override: cli.blocksize,
        use_ioctl: cli.use_ioctl,
        use_dedicated: cli.use_dedicated,
        verbose: cli.verbose,
    }) else {
        eprintln!("wipefreespace: nothing to do");
        return ExitCode::from(1);
    };

    install_signal_handler();

    let dispatcher = Dispatcher::new();
    match dispatcher.run(&cli.devices, &config) {
        None => ExitCode::SUCCESS,
        Some(err) => {
            let dev = cli.devices.first().cloned().unwrap_or_default();
            eprintln!("{}", format_failure_line("wipefreespace", &dev, &err, "run"));
            ExitCode::from(err.code() as u8)
        }
    }
}
