//! # corana-core
//!
//! Core of a distributed, rank-based stream processor performing a
//! time-correlation (G2) computation over 120 Hz detector frames. See
//! `SPEC_FULL.md` at the workspace root for the full component design;
//! each module below corresponds to one of its numbered sections.
//!
//! Ranks (server / master / viewer / worker) are modeled as `tokio`
//! tasks rather than OS processes; [`channels`] builds the fixed set of
//! channel endpoints each task needs, once, from a [`topology::CommLayout`].
//! [`runtime`] ties role construction and task spawning together into one
//! run.

pub mod channels;
pub mod colors;
pub mod config;
pub mod counter;
pub mod datasource;
pub mod error;
pub mod g2;
pub mod mask;
pub mod master;
pub mod publisher;
pub mod ring;
pub mod runtime;
pub mod server;
pub mod topology;
pub mod viewer;
pub mod worker;

pub use error::{CoranaError, Result};
