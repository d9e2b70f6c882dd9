//! archfix Common Library
//!
//! Shared types, naming conventions and configuration loading for the
//! `archfix` workspace crates.
//!
//! # Module Structure
//!
//! - [`arch`] - The `Architecture` classification
//! - [`consts`] - On-disk naming conventions and fixed limits
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use archfix_common::prelude::*;
//!
//! assert_eq!(Architecture::from_machine("aarch64"), Architecture::Arm64);
//! ```

pub mod arch;
pub mod config;
pub mod consts;
pub mod prelude;
