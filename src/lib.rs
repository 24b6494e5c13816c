//! # flowcoord
//!
//! Work-coordination layer for a business-process engine.
//!
//! Provides advisory per-entity locks, deadline-bounded connector execution
//! with failed-connector reset, auditing of stuck or looping asynchronous
//! work, and first-in-first-matched message event correlation. Process
//! semantics and storage live elsewhere; this crate is what they call into.

pub mod audit;
pub mod clock;
pub mod config;
pub mod connector;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod telemetry;

pub use error::{Error, Result};
