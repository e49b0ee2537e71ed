//! Donut Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, validated names, metadata
//! record types and settings used by every donut component.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Md5Calculator, normalize_md5};
pub use config::Settings;
pub use error::{Error, Result, ResultExt};
pub use types::*;
