//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the offline cache engine:
//! - Logging and tracing infrastructure
//! - Engine configuration and bridge injection
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the engine crates depend on. It
//! establishes the logging conventions, the fail-fast capability checks and
//! the typed event stream the UI subscribes to.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
