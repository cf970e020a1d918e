//! # Vigil Core
//!
//! Shared foundation for the Vigil daemon: configuration loading and the
//! error taxonomy used across every crate in the workspace.

pub mod config;
pub mod error;

pub use config::VigilConfig;
pub use error::{Result, VigilError};
