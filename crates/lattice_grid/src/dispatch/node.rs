//! Per-node dispatch runtime and the cluster-wide fan-out orchestrator.
//!
//! `NodeDispatch` owns the lock banks, the call registry, the bounded
//! execution pool, and the collaborator handles. It is constructed once at
//! node startup and cloned into every request-handling task; there are no
//! ambient singletons.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error};

use super::error::{OpError, WireError};
use super::executor::{self, ResponseSink};
use super::invocation::InvocationBuilder;
use super::locks::LockTable;
use super::registry::CallRegistry;
use super::types::{
    DispatchConfig, NodeId, OpContext, OpResult, Operation, OperationCodec, OperationFrame,
    OperationHeader, PartitionId, PartitionRouter, ResponseFrame, ServiceRegistry, Transport,
};

/// Retry policy for the owner-level calls of a cluster-wide fan-out.
const FANOUT_TRY_COUNT: u32 = 5;
const FANOUT_TRY_PAUSE: Duration = Duration::from_millis(300);

struct NodeInner {
    local_id: NodeId,
    config: DispatchConfig,
    locks: LockTable,
    registry: CallRegistry,
    router: Arc<dyn PartitionRouter>,
    codec: Arc<dyn OperationCodec>,
    transport: Arc<dyn Transport>,
    services: Arc<dyn ServiceRegistry>,
    exec_permits: Arc<Semaphore>,
}

/// Shared handle to one node's dispatch runtime.
#[derive(Clone)]
pub struct NodeDispatch {
    inner: Arc<NodeInner>,
}

impl NodeDispatch {
    pub fn new(
        local_id: NodeId,
        config: DispatchConfig,
        router: Arc<dyn PartitionRouter>,
        codec: Arc<dyn OperationCodec>,
        transport: Arc<dyn Transport>,
        services: Arc<dyn ServiceRegistry>,
    ) -> Self {
        let locks = LockTable::new(config.partition_count, config.key_lock_count);
        let exec_permits = Arc::new(Semaphore::new(config.max_concurrent_operations.max(1)));
        Self {
            inner: Arc::new(NodeInner {
                local_id,
                config,
                locks,
                registry: CallRegistry::new(),
                router,
                codec,
                transport,
                services,
                exec_permits,
            }),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.inner.registry
    }

    pub fn services(&self) -> &dyn ServiceRegistry {
        self.inner.services.as_ref()
    }

    pub(crate) fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    pub(crate) fn router(&self) -> &dyn PartitionRouter {
        self.inner.router.as_ref()
    }

    pub(crate) fn codec(&self) -> &dyn OperationCodec {
        self.inner.codec.as_ref()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    /// Start configuring one dispatch of `operation`.
    pub fn invocation_builder(
        &self,
        service: &str,
        operation: Arc<dyn Operation>,
        partition_id: Option<PartitionId>,
    ) -> InvocationBuilder {
        InvocationBuilder::new(self.clone(), service, operation, partition_id)
    }

    /// Submit a context-attached operation to the bounded execution pool,
    /// fire-and-forget.
    pub fn run_locally(
        &self,
        service: &str,
        operation: Arc<dyn Operation>,
        partition_id: Option<PartitionId>,
    ) {
        let header = OperationHeader {
            service: service.to_string(),
            partition_id,
            replica_index: 0,
            caller: self.local_id(),
            call_id: 0,
        };
        let node = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = node.inner.exec_permits.clone().acquire_owned().await else {
                return;
            };
            executor::execute(&node, operation, header, ResponseSink::Discard).await;
        });
    }

    /// Inbound wire unit: decode, attach context, and execute on the pool.
    /// The caller's response sink is installed before decoding so codec
    /// breakage still answers tracked calls.
    pub fn handle_operation(&self, frame: OperationFrame) {
        let node = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = node.inner.exec_permits.clone().acquire_owned().await else {
                return;
            };
            let sink = ResponseSink::for_inbound(frame.caller, frame.call_id);
            let operation = match node.codec().decode(&frame.payload) {
                Ok(operation) => operation,
                Err(err) => {
                    error!(
                        service = %frame.service,
                        caller = frame.caller,
                        error = %err,
                        "failed to decode inbound operation"
                    );
                    let failure = OpError::other(format!("operation decode failed: {err:#}"));
                    sink.deliver(&node, Err(failure)).await;
                    return;
                }
            };
            let header = OperationHeader {
                service: frame.service,
                partition_id: frame.partition_id,
                replica_index: frame.replica_index,
                caller: frame.caller,
                call_id: frame.call_id,
            };
            executor::execute(&node, operation, header, sink).await;
        });
    }

    /// Inbound response unit: complete the matching tracked call.
    pub fn handle_response(&self, frame: ResponseFrame) {
        let result = match frame.result {
            Ok(value) => Ok(value),
            Err(wire) => Err(OpError::Remote(wire)),
        };
        self.inner.registry.notify(frame.call_id, result);
    }

    /// A peer left the cluster: fail every call still waiting on it.
    pub fn on_member_left(&self, node: NodeId) {
        self.inner.registry.on_disconnect(node);
    }

    /// Execute an operation through the full state machine on this node and
    /// wait for its result.
    pub(crate) async fn execute_local(
        &self,
        operation: Arc<dyn Operation>,
        partition_id: Option<PartitionId>,
    ) -> OpResult {
        let header = OperationHeader {
            service: operation.service_name().to_string(),
            partition_id,
            replica_index: 0,
            caller: self.local_id(),
            call_id: 0,
        };
        let (tx, rx) = oneshot::channel();
        executor::execute(self, operation, header, ResponseSink::Local(tx)).await;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(OpError::other("local response slot dropped")),
        }
    }

    /// Dispatch `operation` once per partition across the whole cluster.
    ///
    /// Partitions are grouped by owner and served by one
    /// [`PartitionSweep`] invocation per owner (5 attempts, 300 ms pause);
    /// a failed owner-level call marks its whole subset failed without
    /// aborting the rest. Every failed partition is then retried with a
    /// fresh single-partition invocation under the default policy, and its
    /// outcome replaces the failure entry.
    pub async fn invoke_on_all_partitions(
        &self,
        service: &str,
        operation: Arc<dyn Operation>,
    ) -> Result<HashMap<PartitionId, OpResult>, OpError> {
        let mut results: HashMap<PartitionId, OpResult> = HashMap::new();
        let mut by_owner: HashMap<NodeId, Vec<PartitionId>> = HashMap::new();
        for partition in 0..self.inner.config.partition_count {
            match self.router().owner_of(partition) {
                Some(owner) => by_owner.entry(owner).or_default().push(partition),
                // Ownership not assigned yet: leave it to the per-partition
                // retry pass.
                None => {
                    results.insert(
                        partition,
                        Err(OpError::WrongTarget {
                            this: self.local_id(),
                            expected: None,
                            partition: Some(partition),
                            service: service.to_string(),
                        }),
                    );
                }
            }
        }

        // Encode once; the per-owner sweeps all carry the same payload.
        let payload = self
            .codec()
            .encode(operation.as_ref())
            .map_err(OpError::from)?;

        let owner_calls = by_owner.into_iter().map(|(owner, partitions)| {
            let sweep: Arc<dyn Operation> = Arc::new(PartitionSweep {
                service: service.to_string(),
                partitions: partitions.clone(),
                payload: payload.clone(),
            });
            let invocation = self
                .invocation_builder(service, sweep, None)
                .target(owner)
                .try_count(FANOUT_TRY_COUNT)
                .try_pause(FANOUT_TRY_PAUSE)
                .build();
            async move {
                let outcome = match invocation {
                    Ok(invocation) => invocation.invoke().await,
                    Err(err) => Err(err),
                };
                (owner, partitions, outcome)
            }
        });

        for (owner, partitions, outcome) in future::join_all(owner_calls).await {
            match outcome.and_then(SweepOutcome::from_response) {
                Ok(sweep) => {
                    for (partition, result) in sweep.into_results() {
                        results.insert(partition, result);
                    }
                    for partition in partitions {
                        results.entry(partition).or_insert_with(|| {
                            Err(OpError::other(format!(
                                "owner {owner} returned no result for partition {partition}"
                            )))
                        });
                    }
                }
                Err(err) => {
                    debug!(owner, error = %err, "owner-level fan-out call failed");
                    for partition in partitions {
                        results.insert(partition, Err(err.clone()));
                    }
                }
            }
        }

        let failed: Vec<PartitionId> = results
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(partition, _)| *partition)
            .collect();
        let retries = failed.into_iter().map(|partition| {
            let invocation = self
                .invocation_builder(service, operation.clone(), Some(partition))
                .build();
            async move {
                let outcome = match invocation {
                    Ok(invocation) => invocation.invoke().await,
                    Err(err) => Err(err),
                };
                (partition, outcome)
            }
        });
        for (partition, outcome) in future::join_all(retries).await {
            results.insert(partition, outcome);
        }

        Ok(results)
    }
}

/// Per-partition results returned by a [`PartitionSweep`].
#[derive(Debug, Serialize, Deserialize)]
pub struct SweepOutcome {
    results: Vec<(PartitionId, Result<Option<Bytes>, WireError>)>,
}

impl SweepOutcome {
    fn from_response(response: Option<Bytes>) -> Result<Self, OpError> {
        let Some(bytes) = response else {
            return Err(OpError::other("partition sweep returned no payload"));
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| OpError::other(format!("partition sweep outcome decode failed: {err}")))
    }

    pub fn into_results(self) -> impl Iterator<Item = (PartitionId, OpResult)> {
        self.results
            .into_iter()
            .map(|(partition, result)| (partition, result.map_err(OpError::Remote)))
    }
}

/// Composite operation that executes an encoded inner operation once per
/// partition on the receiving owner, recursing into the full operation
/// executor for each.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionSweep {
    pub service: String,
    pub partitions: Vec<PartitionId>,
    pub payload: Bytes,
}

#[async_trait]
impl Operation for PartitionSweep {
    fn service_name(&self) -> &str {
        &self.service
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn partition_scoped(&self) -> bool {
        false
    }

    async fn run(&self, ctx: OpContext<'_>) -> OpResult {
        let mut results = Vec::with_capacity(self.partitions.len());
        for &partition in &self.partitions {
            // Decode fresh per partition: one operation value is dispatched
            // at most once.
            let result = match ctx.node.codec().decode(&self.payload) {
                Ok(inner) => ctx.node.execute_local(inner, Some(partition)).await,
                Err(err) => Err(OpError::from(err)),
            };
            results.push((
                partition,
                result.map_err(|err| WireError::from(&err)),
            ));
        }
        let outcome = SweepOutcome { results };
        let bytes = serde_json::to_vec(&outcome)
            .map_err(|err| OpError::other(format!("partition sweep outcome encode failed: {err}")))?;
        Ok(Some(Bytes::from(bytes)))
    }
}

/// Simple process-local service registry.
pub struct InMemoryServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, service: Arc<dyn Any + Send + Sync>) {
        self.services
            .write()
            .unwrap()
            .insert(name.to_string(), service);
    }
}

impl Default for InMemoryServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry for InMemoryServiceRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.read().unwrap().get(name).cloned()
    }
}
