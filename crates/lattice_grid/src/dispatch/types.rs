//! Shared types for the dispatch core.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by every layer: the data model (headers, frames, config), the
//! `Operation` contract, and the trait seams for the external collaborators
//! (partition router, operation codec, transport, service registry).

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{OpError, WireError};
use super::node::NodeDispatch;

/// Logical node identifier within the cluster.
pub type NodeId = u64;
/// Identifier of one keyspace partition.
pub type PartitionId = u64;

/// Final outcome of one executed operation: an optional payload or a
/// classified failure.
pub type OpResult = Result<Option<Bytes>, OpError>;

/// Per-node dispatch tuning.
///
/// Durations are carried as milliseconds so the struct deserializes from
/// plain config files.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of keyspace partitions hosted by the cluster.
    pub partition_count: u64,
    /// Size of the hashed key-lock bank. Two keys hashing to the same slot
    /// serialize against each other; the bank is sized once at startup.
    pub key_lock_count: usize,
    /// Upper bound on operations executing concurrently on this node.
    pub max_concurrent_operations: usize,
    /// Default number of attempts for an invocation.
    pub default_try_count: u32,
    /// Default pause between invocation attempts, in milliseconds.
    pub default_try_pause_ms: u64,
    /// Default deadline for a remote response, in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
            key_lock_count: 1024,
            max_concurrent_operations: 64,
            default_try_count: 1,
            default_try_pause_ms: 500,
            call_timeout_ms: 60_000,
        }
    }
}

impl DispatchConfig {
    pub fn default_try_pause(&self) -> Duration {
        Duration::from_millis(self.default_try_pause_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Routing context attached to an operation at dispatch time.
///
/// The header travels in the wire envelope, not inside the encoded
/// operation, so a decoded operation can be re-dispatched with fresh
/// context.
#[derive(Clone, Debug)]
pub struct OperationHeader {
    pub service: String,
    pub partition_id: Option<PartitionId>,
    pub replica_index: usize,
    pub caller: NodeId,
    /// Id of the tracked call awaiting this operation's response;
    /// 0 means fire-and-forget.
    pub call_id: u64,
}

/// Durability mode for replica propagation of a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// Await an acknowledgment from every reachable backup replica, each up
    /// to `ack_timeout`.
    Sync { ack_timeout: Duration },
    /// Transmit once per replica, no acknowledgment, no retry.
    Async,
}

/// Companion replication work derived from a backup-aware operation.
#[derive(Clone)]
pub struct BackupPlan {
    pub operation: Arc<dyn Operation>,
    pub backup_count: usize,
    pub durability: Durability,
}

/// Execution-scope marker threaded explicitly through the dispatch path.
///
/// Carries the operation currently running on the task, so a key-scoped
/// operation that synchronously issues another key-scoped invocation is
/// rejected before it can re-enter the key-lock bank or deadlock across
/// nodes.
#[derive(Clone, Debug, Default)]
pub struct TaskContext {
    current_key_op: Option<String>,
}

impl TaskContext {
    /// Context for a task that is about to run `service`'s operation.
    pub(crate) fn for_operation(service: &str, key_scoped: bool) -> Self {
        Self {
            current_key_op: key_scoped.then(|| service.to_string()),
        }
    }

    /// Service name of the key-scoped operation running on this task, if any.
    pub fn in_key_operation(&self) -> Option<&str> {
        self.current_key_op.as_deref()
    }
}

/// Everything an operation's `run` can reach: the node runtime, its own
/// routing header, and the task-scope marker to thread into nested
/// invocations.
pub struct OpContext<'a> {
    pub node: &'a NodeDispatch,
    pub header: &'a OperationHeader,
    pub task: &'a TaskContext,
}

impl OpContext<'_> {
    /// Look up the named service handle and downcast it.
    pub fn service<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.node.services().lookup(name)?.downcast::<T>().ok()
    }
}

/// A unit of work dispatched to a partition owner or replica.
///
/// Capability methods default to the least privileged shape; implementations
/// opt in to partition scoping, the write class, key scoping, and backup
/// propagation.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    /// Name of the service this operation belongs to.
    fn service_name(&self) -> &str;

    /// The operation's own logic. Awaited to completion by the executor
    /// while any acquired locks are held.
    async fn run(&self, ctx: OpContext<'_>) -> OpResult;

    /// Concrete-type access for codec implementations.
    fn as_any(&self) -> &dyn Any;

    /// Whether this operation is scoped to a single partition.
    fn partition_scoped(&self) -> bool {
        true
    }

    /// Write-class operations take the partition's exclusive write lock.
    fn write_class(&self) -> bool {
        false
    }

    /// Hash of the key this operation is scoped to, if any.
    fn key_hash(&self) -> Option<u64> {
        None
    }

    /// Whether this operation is itself a backup replay.
    fn is_backup(&self) -> bool {
        false
    }

    /// Replication work to perform after a successful run.
    fn backup(&self) -> Option<BackupPlan> {
        None
    }

    /// Backups are exempt from replica-target validation.
    fn should_validate_target(&self) -> bool {
        !self.is_backup()
    }

    /// Join-protocol operations skip the cluster membership check.
    fn is_join(&self) -> bool {
        false
    }
}

/// Inbound wire unit carrying one encoded operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationFrame {
    pub service: String,
    pub payload: Bytes,
    pub partition_id: Option<PartitionId>,
    pub replica_index: usize,
    pub call_id: u64,
    pub caller: NodeId,
}

/// Outbound wire unit completing one tracked call on the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub call_id: u64,
    pub result: Result<Option<Bytes>, WireError>,
}

impl ResponseFrame {
    pub(crate) fn from_result(call_id: u64, result: &OpResult) -> Self {
        Self {
            call_id,
            result: match result {
                Ok(value) => Ok(value.clone()),
                Err(err) => Err(WireError::from(err)),
            },
        }
    }
}

/// Read-only partition-ownership view, supplied by the cluster layer.
///
/// The dispatch core only queries ownership; the migration algorithm that
/// rewrites it lives elsewhere.
pub trait PartitionRouter: Send + Sync + 'static {
    fn partition_count(&self) -> u64;

    /// Address of the replica at `replica_index` for `partition`
    /// (0 = owner), or `None` while unassigned.
    fn replica_address(&self, partition: PartitionId, replica_index: usize) -> Option<NodeId>;

    fn owner_of(&self, partition: PartitionId) -> Option<NodeId> {
        self.replica_address(partition, 0)
    }

    fn cluster_size(&self) -> usize;

    fn is_member(&self, node: NodeId) -> bool;
}

/// Operation payload codec, supplied by the serialization layer and assumed
/// correct; the dispatch core only calls it.
pub trait OperationCodec: Send + Sync + 'static {
    fn encode(&self, op: &dyn Operation) -> anyhow::Result<Bytes>;
    fn decode(&self, payload: &[u8]) -> anyhow::Result<Arc<dyn Operation>>;
}

/// Network transport seam. Implementations own connection management
/// (get-or-connect, reconnects); a `false` return means the frame was not
/// handed to the peer and is treated as a transient failure.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_operation(&self, target: NodeId, frame: OperationFrame) -> bool;
    async fn send_response(&self, target: NodeId, frame: ResponseFrame) -> bool;
}

/// Registry of named service handles used to route decoded operations.
pub trait ServiceRegistry: Send + Sync + 'static {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}
