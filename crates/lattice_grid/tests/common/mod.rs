//! Shared in-process harness for dispatch integration tests.
//!
//! Builds a multi-node mesh out of loopback transports: frames sent to a
//! peer are handed straight to that peer's `NodeDispatch`, so the full
//! routed path (codec, registry, executor, response frames) is exercised
//! without sockets.
#![allow(dead_code)]

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use lattice_grid::dispatch::{
    BackupPlan, DispatchConfig, Durability, InMemoryServiceRegistry, NodeDispatch, NodeId,
    OpContext, OpError, OpResult, Operation, OperationCodec, OperationFrame, PartitionId,
    PartitionRouter, PartitionSweep, ResponseFrame, Transport,
};

/// Opt-in log output for debugging test runs (`RUST_LOG=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Poll `check` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Mutable partition table + membership view shared by every node.
pub struct TestRouter {
    partition_count: u64,
    replicas: RwLock<HashMap<PartitionId, Vec<NodeId>>>,
    members: RwLock<BTreeSet<NodeId>>,
}

impl TestRouter {
    pub fn new(partition_count: u64, members: &[NodeId]) -> Self {
        Self {
            partition_count,
            replicas: RwLock::new(HashMap::new()),
            members: RwLock::new(members.iter().copied().collect()),
        }
    }

    pub fn set_replicas(&self, partition: PartitionId, replicas: Vec<NodeId>) {
        self.replicas.write().unwrap().insert(partition, replicas);
    }

    pub fn remove_member(&self, node: NodeId) {
        self.members.write().unwrap().remove(&node);
    }
}

impl PartitionRouter for TestRouter {
    fn partition_count(&self) -> u64 {
        self.partition_count
    }

    fn replica_address(&self, partition: PartitionId, replica_index: usize) -> Option<NodeId> {
        self.replicas
            .read()
            .unwrap()
            .get(&partition)?
            .get(replica_index)
            .copied()
    }

    fn cluster_size(&self) -> usize {
        self.members.read().unwrap().len()
    }

    fn is_member(&self, node: NodeId) -> bool {
        self.members.read().unwrap().contains(&node)
    }
}

/// Loopback mesh connecting every node's transport to its peers.
pub struct Mesh {
    nodes: Mutex<HashMap<NodeId, NodeDispatch>>,
    /// Sends to these nodes are refused (`send` returns false).
    unreachable: Mutex<HashSet<NodeId>>,
    /// Sends to these nodes succeed but the frame is dropped undelivered.
    blackhole: Mutex<HashSet<NodeId>>,
    sent_operations: Mutex<Vec<(NodeId, OperationFrame)>>,
}

impl Mesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            blackhole: Mutex::new(HashSet::new()),
            sent_operations: Mutex::new(Vec::new()),
        })
    }

    pub fn add_node(&self, id: NodeId, dispatch: NodeDispatch) {
        self.nodes.lock().unwrap().insert(id, dispatch);
    }

    pub fn set_unreachable(&self, node: NodeId, down: bool) {
        let mut unreachable = self.unreachable.lock().unwrap();
        if down {
            unreachable.insert(node);
        } else {
            unreachable.remove(&node);
        }
    }

    pub fn set_blackhole(&self, node: NodeId, dropped: bool) {
        let mut blackhole = self.blackhole.lock().unwrap();
        if dropped {
            blackhole.insert(node);
        } else {
            blackhole.remove(&node);
        }
    }

    /// Operation frames accepted for `target` so far.
    pub fn operations_sent_to(&self, target: NodeId) -> Vec<OperationFrame> {
        self.sent_operations
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == target)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

pub struct MeshTransport {
    mesh: Arc<Mesh>,
}

impl MeshTransport {
    pub fn new(mesh: Arc<Mesh>) -> Self {
        Self { mesh }
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn send_operation(&self, target: NodeId, frame: OperationFrame) -> bool {
        if self.mesh.unreachable.lock().unwrap().contains(&target) {
            return false;
        }
        self.mesh
            .sent_operations
            .lock()
            .unwrap()
            .push((target, frame.clone()));
        if self.mesh.blackhole.lock().unwrap().contains(&target) {
            return true;
        }
        let node = self.mesh.nodes.lock().unwrap().get(&target).cloned();
        match node {
            Some(node) => {
                node.handle_operation(frame);
                true
            }
            None => false,
        }
    }

    async fn send_response(&self, target: NodeId, frame: ResponseFrame) -> bool {
        if self.mesh.unreachable.lock().unwrap().contains(&target) {
            return false;
        }
        if self.mesh.blackhole.lock().unwrap().contains(&target) {
            return true;
        }
        let node = self.mesh.nodes.lock().unwrap().get(&target).cloned();
        match node {
            Some(node) => {
                node.handle_response(frame);
                true
            }
            None => false,
        }
    }
}

/// Per-node service state the test operations record into.
#[derive(Default)]
pub struct TestService {
    pub store: Mutex<HashMap<String, String>>,
    pub backups_applied: AtomicUsize,
    key_active: Mutex<HashMap<String, usize>>,
    /// Highest number of concurrently running probes observed for any key.
    pub key_overlap_max: AtomicUsize,
    ops_active: AtomicUsize,
    write_running: AtomicBool,
    /// Number of times a probe observed another operation running while a
    /// write-class probe held the partition.
    pub lock_violations: AtomicUsize,
    /// Remaining induced failures per partition.
    pub induced_failures: Mutex<HashMap<PartitionId, u32>>,
    pub runs: Mutex<HashMap<PartitionId, u32>>,
}

impl TestService {
    fn enter_key(&self, key: &str) {
        let active = {
            let mut map = self.key_active.lock().unwrap();
            let entry = map.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        self.key_overlap_max.fetch_max(active, Ordering::SeqCst);
    }

    fn exit_key(&self, key: &str) {
        let mut map = self.key_active.lock().unwrap();
        if let Some(entry) = map.get_mut(key) {
            *entry -= 1;
        }
    }

    pub fn induce_failures(&self, partition: PartitionId, times: u32) {
        self.induced_failures
            .lock()
            .unwrap()
            .insert(partition, times);
    }

    pub fn runs_on(&self, partition: PartitionId) -> u32 {
        self.runs
            .lock()
            .unwrap()
            .get(&partition)
            .copied()
            .unwrap_or(0)
    }
}

/// Test operations, one enum so the codec stays trivial.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TestOp {
    /// Partition-scoped read returning which node answered.
    Ping,
    /// Key-scoped probe that holds its key for a while and records overlap.
    KeyProbe { key: String, hold_ms: u64 },
    /// Read-scoped probe used alongside write probes.
    ReadProbe { hold_ms: u64 },
    /// Write-class probe asserting whole-partition exclusivity.
    WriteProbe { hold_ms: u64 },
    /// Fails as many times per partition as the service was told to.
    Flaky,
    /// Key-scoped mutation with backup propagation.
    BackupWrite {
        key: String,
        value: String,
        backup_count: usize,
        /// Some = synchronous acks with this timeout, None = fire-and-forget.
        sync_ack_ms: Option<u64>,
    },
    /// Backup replay of a mutation.
    BackupApply { key: String, value: String },
    /// Key-scoped operation that issues another key-scoped invocation from
    /// its own execution context.
    Nested { key: String },
}

#[async_trait]
impl Operation for TestOp {
    fn service_name(&self) -> &str {
        "test"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn write_class(&self) -> bool {
        matches!(self, TestOp::WriteProbe { .. })
    }

    fn key_hash(&self) -> Option<u64> {
        match self {
            TestOp::KeyProbe { key, .. }
            | TestOp::BackupWrite { key, .. }
            | TestOp::Nested { key } => Some(hash_key(key.as_bytes())),
            _ => None,
        }
    }

    fn is_backup(&self) -> bool {
        matches!(self, TestOp::BackupApply { .. })
    }

    fn backup(&self) -> Option<BackupPlan> {
        match self {
            TestOp::BackupWrite {
                key,
                value,
                backup_count,
                sync_ack_ms,
            } => Some(BackupPlan {
                operation: Arc::new(TestOp::BackupApply {
                    key: key.clone(),
                    value: value.clone(),
                }),
                backup_count: *backup_count,
                durability: match sync_ack_ms {
                    Some(ms) => Durability::Sync {
                        ack_timeout: Duration::from_millis(*ms),
                    },
                    None => Durability::Async,
                },
            }),
            _ => None,
        }
    }

    async fn run(&self, ctx: OpContext<'_>) -> OpResult {
        let service: Arc<TestService> = ctx.service("test").expect("test service registered");
        if let Some(partition) = ctx.header.partition_id {
            *service.runs.lock().unwrap().entry(partition).or_insert(0) += 1;
        }

        match self {
            TestOp::Ping => Ok(Some(Bytes::from(format!("pong@{}", ctx.node.local_id())))),
            TestOp::KeyProbe { key, hold_ms } => {
                service.enter_key(key);
                tokio::time::sleep(Duration::from_millis(*hold_ms)).await;
                service.exit_key(key);
                Ok(None)
            }
            TestOp::ReadProbe { hold_ms } => {
                service.ops_active.fetch_add(1, Ordering::SeqCst);
                if service.write_running.load(Ordering::SeqCst) {
                    service.lock_violations.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(*hold_ms)).await;
                service.ops_active.fetch_sub(1, Ordering::SeqCst);
                Ok(None)
            }
            TestOp::WriteProbe { hold_ms } => {
                let others = service.ops_active.fetch_add(1, Ordering::SeqCst);
                if others > 0 {
                    service.lock_violations.fetch_add(1, Ordering::SeqCst);
                }
                service.write_running.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(*hold_ms)).await;
                service.write_running.store(false, Ordering::SeqCst);
                service.ops_active.fetch_sub(1, Ordering::SeqCst);
                Ok(None)
            }
            TestOp::Flaky => {
                let partition = ctx.header.partition_id.unwrap_or(0);
                {
                    let mut failures = service.induced_failures.lock().unwrap();
                    if let Some(left) = failures.get_mut(&partition) {
                        if *left > 0 {
                            *left -= 1;
                            return Err(OpError::Other(format!(
                                "induced failure on partition {partition}"
                            )));
                        }
                    }
                }
                Ok(Some(Bytes::from(format!(
                    "ok@{}:{partition}",
                    ctx.node.local_id()
                ))))
            }
            TestOp::BackupWrite { key, value, .. } => {
                service
                    .store
                    .lock()
                    .unwrap()
                    .insert(key.clone(), value.clone());
                Ok(Some(Bytes::from_static(b"applied")))
            }
            TestOp::BackupApply { key, value } => {
                service
                    .store
                    .lock()
                    .unwrap()
                    .insert(key.clone(), value.clone());
                service.backups_applied.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
            TestOp::Nested { key } => {
                let inner: Arc<dyn Operation> = Arc::new(TestOp::KeyProbe {
                    key: key.clone(),
                    hold_ms: 0,
                });
                ctx.node
                    .invocation_builder("test", inner, ctx.header.partition_id)
                    .task_context(ctx.task)
                    .build()?
                    .invoke()
                    .await
            }
        }
    }
}

/// Codec double: JSON envelope over the test operations plus the core's
/// partition sweep.
pub struct TestCodec;

#[derive(Serialize, Deserialize)]
enum Envelope {
    Op(TestOp),
    Sweep(PartitionSweep),
}

impl OperationCodec for TestCodec {
    fn encode(&self, op: &dyn Operation) -> anyhow::Result<Bytes> {
        let envelope = if let Some(sweep) = op.as_any().downcast_ref::<PartitionSweep>() {
            Envelope::Sweep(sweep.clone())
        } else if let Some(op) = op.as_any().downcast_ref::<TestOp>() {
            Envelope::Op(op.clone())
        } else {
            anyhow::bail!("unknown operation type");
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn decode(&self, payload: &[u8]) -> anyhow::Result<Arc<dyn Operation>> {
        Ok(match serde_json::from_slice::<Envelope>(payload)? {
            Envelope::Op(op) => Arc::new(op),
            Envelope::Sweep(sweep) => Arc::new(sweep),
        })
    }
}

pub struct TestNode {
    pub dispatch: NodeDispatch,
    pub service: Arc<TestService>,
}

pub struct TestCluster {
    pub mesh: Arc<Mesh>,
    pub router: Arc<TestRouter>,
    nodes: HashMap<NodeId, TestNode>,
}

impl TestCluster {
    pub fn dispatch(&self, id: NodeId) -> &NodeDispatch {
        &self.nodes[&id].dispatch
    }

    pub fn service(&self, id: NodeId) -> &Arc<TestService> {
        &self.nodes[&id].service
    }
}

pub fn test_config(partition_count: u64) -> DispatchConfig {
    DispatchConfig {
        partition_count,
        key_lock_count: 16,
        max_concurrent_operations: 32,
        default_try_count: 1,
        default_try_pause_ms: 50,
        call_timeout_ms: 2_000,
    }
}

/// Build a mesh cluster with one `TestService` per node. Partition
/// assignments are left to the test via `TestRouter::set_replicas`.
pub fn build_cluster(ids: &[NodeId], partition_count: u64) -> TestCluster {
    let router = Arc::new(TestRouter::new(partition_count, ids));
    let mesh = Mesh::new();
    let mut nodes = HashMap::new();
    for &id in ids {
        let registry = Arc::new(InMemoryServiceRegistry::new());
        let service = Arc::new(TestService::default());
        registry.register("test", service.clone());
        let dispatch = NodeDispatch::new(
            id,
            test_config(partition_count),
            router.clone(),
            Arc::new(TestCodec),
            Arc::new(MeshTransport::new(mesh.clone())),
            registry,
        );
        mesh.add_node(id, dispatch.clone());
        nodes.insert(id, TestNode { dispatch, service });
    }
    TestCluster {
        mesh,
        router,
        nodes,
    }
}
