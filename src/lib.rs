//! Filesystem-aware secure wiping of free blocks, file slack and
//! deleted-file metadata.
//!
//! The crate is organized leaves-first, mirroring the component table of
//! the design this tool follows: a deterministic pattern generator and
//! block I/O glue at the bottom, one module per supported filesystem
//! family in `backend`, and the `Dispatcher` on top driving the fixed
//! probe order and phase sequence.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![allow(clippy::too_many_arguments)]

pub mod backend;
pub mod blockio;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mount;
pub mod pattern;
pub mod progress;

pub use dispatch::Dispatcher;
pub use error::{WfsError, WfsResult};
