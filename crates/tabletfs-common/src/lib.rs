//! TabletFS Common - Shared types and utilities
//!
//! This crate provides the error type, identifiers and configuration
//! structures shared by the TabletFS storage layer and its tools.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BlockManagerType, FsManagerOptions};
pub use error::{Error, ErrorKind, IoResultExt, Result};
pub use types::*;
