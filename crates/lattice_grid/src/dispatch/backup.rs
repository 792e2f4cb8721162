//! Replica propagation of backup-aware mutations.
//!
//! Synchronous propagation dispatches one invocation per backup replica and
//! awaits every acknowledgment; asynchronous propagation encodes once and
//! fires one frame per replica. Both are best-effort: unresolved replicas
//! are skipped silently and already-applied backups are never rolled back.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time;
use tracing::{debug, warn};

use super::error::OpError;
use super::node::NodeDispatch;
use super::types::{BackupPlan, OperationFrame, PartitionId};

/// Clamp the requested backup count to the replicas the cluster can hold.
fn clamped_count(node: &NodeDispatch, requested: usize) -> usize {
    requested.min(node.router().cluster_size().saturating_sub(1))
}

/// Dispatch the backup operation to replicas 1..=count and await each
/// acknowledgment up to `ack_timeout`. A missing or late ack fails the
/// overall operation with `Timeout`; an acknowledged failure propagates
/// as-is.
//
// Returns a boxed `Send` future rather than being a plain `async fn`: the
// backup path recurses (`invoke` → executor → `take_backups` →
// `tokio::spawn(invoke())`), and type-erasing this future behind a `Send`
// trait object breaks the otherwise-cyclic auto-trait inference that would
// leave the spawned `invoke()` future unprovably `Send`.
pub(crate) fn take_backups<'a>(
    node: &'a NodeDispatch,
    plan: &'a BackupPlan,
    partition: PartitionId,
    ack_timeout: Duration,
) -> Pin<Box<dyn Future<Output = Result<(), OpError>> + Send + 'a>> {
    Box::pin(async move {
        let count = clamped_count(node, plan.backup_count);
        let mut pending = Vec::with_capacity(count);
        for replica_index in 1..=count {
            let Some(target) = node.router().replica_address(partition, replica_index) else {
                continue;
            };
            if target == node.local_id() {
                continue;
            }
            let invocation = node
                .invocation_builder(
                    plan.operation.service_name(),
                    plan.operation.clone(),
                    Some(partition),
                )
                .replica_index(replica_index)
                .build()?;
            pending.push((target, tokio::spawn(invocation.invoke())));
        }

        for (target, ack) in pending {
            match time::timeout(ack_timeout, ack).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(err))) => return Err(err),
                Ok(Err(_join)) => {
                    return Err(OpError::other(format!(
                        "backup dispatch task for node {target} aborted"
                    )))
                }
                Err(_) => {
                    return Err(OpError::Timeout {
                        what: format!("backup ack from node {target} for partition {partition}"),
                    })
                }
            }
        }
        Ok(())
    })
}

/// Encode the backup operation once and transmit it fire-and-forget to
/// replicas 1..=count. No registry entry, no acknowledgment, no retry.
pub(crate) async fn send_backups(node: &NodeDispatch, plan: &BackupPlan, partition: PartitionId) {
    let count = clamped_count(node, plan.backup_count);
    if count == 0 {
        return;
    }
    let payload = match node.codec().encode(plan.operation.as_ref()) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(partition, error = %err, "failed to encode backup operation");
            return;
        }
    };

    for replica_index in 1..=count {
        let Some(target) = node.router().replica_address(partition, replica_index) else {
            continue;
        };
        if target == node.local_id() {
            continue;
        }
        let frame = OperationFrame {
            service: plan.operation.service_name().to_string(),
            payload: payload.clone(),
            partition_id: Some(partition),
            replica_index,
            call_id: 0,
            caller: node.local_id(),
        };
        if !node.transport().send_operation(target, frame).await {
            debug!(target, partition, "backup frame not sent");
        }
    }
}
