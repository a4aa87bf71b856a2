//! Command implementations
//!
//! This module contains the actual implementation of CLI commands.
//! Each command is implemented as a separate module.

pub mod config;
pub mod start;
