//! The operation execution state machine.
//!
//! One pass through `execute` attaches context, acquires partition/key
//! locks, runs the operation, triggers backup propagation, and delivers
//! exactly one response to the sink. Lock release is unconditional: key lock
//! first, partition lock second, regardless of which step failed.

use std::sync::Arc;

use tokio::sync::{oneshot, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{debug, error};

use super::backup;
use super::error::OpError;
use super::locks::TryReadPartition;
use super::node::NodeDispatch;
use super::types::{
    Durability, NodeId, OpContext, OpResult, Operation, OperationHeader, ResponseFrame,
    TaskContext,
};

/// Destination for an operation's final result.
pub(crate) enum ResponseSink {
    /// Complete a local invocation.
    Local(oneshot::Sender<OpResult>),
    /// Send a response frame back to the remote caller.
    Remote { caller: NodeId, call_id: u64 },
    /// Fire-and-forget traffic (asynchronous backups): the result is
    /// dropped after logging.
    Discard,
}

impl ResponseSink {
    pub(crate) fn for_inbound(caller: NodeId, call_id: u64) -> Self {
        if call_id == 0 {
            ResponseSink::Discard
        } else {
            ResponseSink::Remote { caller, call_id }
        }
    }

    /// Deliver the result. Consumes the sink: each operation responds
    /// exactly once.
    pub(crate) async fn deliver(self, node: &NodeDispatch, result: OpResult) {
        match self {
            ResponseSink::Local(slot) => {
                // The invocation may have given up waiting.
                let _ = slot.send(result);
            }
            ResponseSink::Remote { caller, call_id } => {
                let frame = ResponseFrame::from_result(call_id, &result);
                if !node.transport().send_response(caller, frame).await {
                    debug!(caller, call_id, "response frame not sent");
                }
            }
            ResponseSink::Discard => {
                if let Err(err) = result {
                    debug!(error = %err, "discarding failure of fire-and-forget operation");
                }
            }
        }
    }
}

/// Held for release-on-drop only.
#[allow(dead_code)]
enum PartitionGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Run one operation to completion and deliver its result to `sink`.
///
/// Failures never escape: they are logged (retryable kinds at low severity)
/// and become the delivered result.
pub(crate) async fn execute(
    node: &NodeDispatch,
    op: Arc<dyn Operation>,
    header: OperationHeader,
    sink: ResponseSink,
) {
    let task = TaskContext::for_operation(&header.service, op.key_hash().is_some());

    let mut partition_guard: Option<PartitionGuard> = None;
    let mut key_guard: Option<OwnedMutexGuard<()>> = None;

    let result = run_guarded(
        node,
        op.as_ref(),
        &header,
        &task,
        &mut partition_guard,
        &mut key_guard,
    )
    .await;

    if let Err(err) = &result {
        if err.is_retryable() {
            debug!(
                service = %header.service,
                partition = ?header.partition_id,
                error = %err,
                "operation failed with retryable error"
            );
        } else {
            error!(
                service = %header.service,
                partition = ?header.partition_id,
                error = %err,
                "operation failed"
            );
        }
    }

    sink.deliver(node, result).await;

    // Key lock before partition lock, in every path.
    drop(key_guard);
    drop(partition_guard);
}

/// Lock acquisition, the operation's own logic, and backup propagation. Any
/// failure short-circuits to the caller, which still releases the guards.
async fn run_guarded(
    node: &NodeDispatch,
    op: &dyn Operation,
    header: &OperationHeader,
    task: &TaskContext,
    partition_guard: &mut Option<PartitionGuard>,
    key_guard: &mut Option<OwnedMutexGuard<()>>,
) -> OpResult {
    if op.partition_scoped() {
        let Some(partition) = header.partition_id else {
            return Err(OpError::Configuration {
                detail: format!(
                    "partition-scoped operation of service {} has no partition id",
                    header.service
                ),
            });
        };

        if op.write_class() {
            let Some(guard) = node.locks().lock_partition_write(partition).await else {
                return Err(unknown_partition(&header.service, partition));
            };
            *partition_guard = Some(PartitionGuard::Write(guard));
        } else {
            match node.locks().try_lock_partition_read(partition) {
                None => return Err(unknown_partition(&header.service, partition)),
                Some(TryReadPartition::Migrating) => {
                    return Err(OpError::PartitionMigrating { partition });
                }
                Some(TryReadPartition::Acquired(guard)) => {
                    *partition_guard = Some(PartitionGuard::Read(guard));
                }
            }

            if op.should_validate_target() {
                let expected = node.router().replica_address(partition, header.replica_index);
                if expected != Some(node.local_id()) {
                    return Err(OpError::WrongTarget {
                        this: node.local_id(),
                        expected,
                        partition: Some(partition),
                        service: header.service.clone(),
                    });
                }
            }

            if let Some(key_hash) = op.key_hash() {
                if !op.is_backup() {
                    *key_guard = Some(node.locks().lock_key(key_hash).await);
                }
            }
        }
    }

    let mut result = op
        .run(OpContext {
            node,
            header,
            task,
        })
        .await;

    if result.is_ok() {
        if let (Some(plan), Some(partition)) = (op.backup(), header.partition_id) {
            match plan.durability {
                Durability::Sync { ack_timeout } => {
                    if let Err(err) = backup::take_backups(node, &plan, partition, ack_timeout).await
                    {
                        result = Err(err);
                    }
                }
                Durability::Async => backup::send_backups(node, &plan, partition).await,
            }
        }
    }

    result
}

fn unknown_partition(service: &str, partition: u64) -> OpError {
    OpError::Configuration {
        detail: format!("operation of service {service} addresses unknown partition {partition}"),
    }
}
