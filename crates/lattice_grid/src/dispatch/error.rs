//! Classified failures produced by the dispatch core.
//!
//! The classification matters operationally: retryable kinds are retried by
//! the owning invocation, everything else surfaces immediately. `WireError`
//! is the serializable form used on response frames so the classification
//! survives the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{NodeId, PartitionId};

/// Failure of one dispatched operation.
#[derive(Clone, Debug, Error)]
pub enum OpError {
    /// The operation was mis-configured for dispatch. Fatal to this
    /// operation only.
    #[error("configuration error: {detail}")]
    Configuration { detail: String },

    /// This node is not a valid target for the given partition/replica;
    /// retryable by re-resolving the route.
    #[error(
        "node {this} is not the target for partition {partition:?} of {service} (expected {expected:?})"
    )]
    WrongTarget {
        this: NodeId,
        expected: Option<NodeId>,
        partition: Option<PartitionId>,
        service: String,
    },

    /// The resolved target is no longer a cluster member.
    #[error("target node {target} is not a member of the cluster")]
    NotAMember { target: NodeId },

    /// The partition read lock was unavailable: a migration is in flight.
    #[error("partition {partition} is migrating")]
    PartitionMigrating { partition: PartitionId },

    /// The transport refused the frame.
    #[error("frame to node {target} was not sent")]
    SendFailure { target: NodeId },

    /// A backup acknowledgment or remote response missed its deadline.
    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    /// A key-scoped operation issued another key-scoped invocation from the
    /// same execution context.
    #[error("nested key invocation from {current} into {requested}")]
    NestedKeyInvocation { current: String, requested: String },

    /// A classified failure reported by a remote node.
    #[error(transparent)]
    Remote(#[from] WireError),

    /// Unclassified operation-logic failure, surfaced as-is.
    #[error("{0}")]
    Other(String),
}

impl OpError {
    /// Whether the owning invocation may retry after re-resolving the
    /// target.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::Configuration { .. } => ErrorKind::Configuration,
            OpError::WrongTarget { .. } => ErrorKind::WrongTarget,
            OpError::NotAMember { .. } => ErrorKind::NotAMember,
            OpError::PartitionMigrating { .. } => ErrorKind::PartitionMigrating,
            OpError::SendFailure { .. } => ErrorKind::SendFailure,
            OpError::Timeout { .. } => ErrorKind::Timeout,
            OpError::NestedKeyInvocation { .. } => ErrorKind::NestedKeyInvocation,
            OpError::Remote(wire) => wire.kind,
            OpError::Other(_) => ErrorKind::Other,
        }
    }

    pub(crate) fn other(detail: impl Into<String>) -> Self {
        OpError::Other(detail.into())
    }
}

impl From<anyhow::Error> for OpError {
    fn from(err: anyhow::Error) -> Self {
        OpError::Other(format!("{err:#}"))
    }
}

/// Wire-safe failure classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    WrongTarget,
    NotAMember,
    PartitionMigrating,
    SendFailure,
    Timeout,
    NestedKeyInvocation,
    Other,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::WrongTarget
                | ErrorKind::NotAMember
                | ErrorKind::PartitionMigrating
                | ErrorKind::SendFailure
        )
    }
}

/// Serializable failure carried on a response frame.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("remote failure ({kind:?}): {message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OpError> for WireError {
    fn from(err: &OpError) -> Self {
        match err {
            OpError::Remote(wire) => wire.clone(),
            other => WireError {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}
