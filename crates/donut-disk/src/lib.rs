//! Donut Disk - storage location abstraction
//!
//! This crate defines the interface the coordinator consumes from a
//! physical storage location:
//! - [`Disk`]: directory creation and byte-oriented file I/O
//! - [`DiskProvider`]: opens a [`Disk`] for a path, injected at construction
//! - [`LocalDisk`]: directory-backed implementation with I/O statistics

pub mod disk;
pub mod local;

pub use disk::{Disk, DiskProvider, DiskStats, DiskStatsSnapshot, ObjectReader, ObjectWriter};
pub use local::{LocalDisk, LocalDiskProvider};
