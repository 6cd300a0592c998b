//! Typed error hierarchy for the correlation pipeline.
//!
//! Mirrors the error kinds a rank can hit: bad configuration/topology are
//! caught at startup and are always fatal; protocol and invariant errors
//! are caught while a rank's loop is running and trigger a world abort via
//! [`crate::runtime::WorldAbort`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoranaError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("protocol error on rank {rank} ({role}): {detail}")]
    Protocol {
        role: &'static str,
        rank: i32,
        detail: String,
    },

    #[error("data error: {0}")]
    Data(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl CoranaError {
    pub fn protocol(role: &'static str, rank: i32, detail: impl Into<String>) -> Self {
        Self::Protocol { role, rank, detail: detail.into() }
    }
}

pub type Result<T> = std::result::Result<T, CoranaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_formats_role_and_rank() {
        let e = CoranaError::protocol("worker", 3, "unexpected tag");
        assert_eq!(
            e.to_string(),
            "protocol error on rank 3 (worker): unexpected tag"
        );
    }
}
