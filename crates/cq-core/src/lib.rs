//! Core domain + application logic for the chat quota gate.
//!
//! This crate is intentionally storage-agnostic. Durable storage and the wall
//! clock live behind ports (traits); the file-backed store is implemented in an
//! adapter crate.

pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod ports;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use errors::{Error, Result};
