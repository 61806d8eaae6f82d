//! Storage layer - temporary swap files for evicted blocks.
//!
//! This module handles the on-disk side of buffer management:
//! - [`TemporaryFileStore`] - swap-file I/O and swap-space accounting
//! - [`TemporaryFileInformation`] - diagnostics for active swap files

mod temp_file;

pub use temp_file::{TemporaryFileInformation, TemporaryFileStore};
