//! Dispatch module wiring.
//!
//! `node` holds the per-node runtime context and the fan-out orchestrator,
//! `executor` runs one operation through its lock/run/respond state machine,
//! `invocation` implements the routed dispatch-with-retry path, `registry`
//! tracks outstanding remote calls, `locks` owns the partition and key lock
//! banks, and `types`/`error` define the shared data model and the external
//! collaborator contracts (router, codec, transport, service registry).

mod backup;
mod error;
mod executor;
mod invocation;
mod locks;
mod node;
mod registry;
mod types;

pub use error::{ErrorKind, OpError, WireError};
pub use invocation::{Invocation, InvocationBuilder};
pub use locks::{LockTable, TryReadPartition};
pub use node::{InMemoryServiceRegistry, NodeDispatch, PartitionSweep, SweepOutcome};
pub use registry::CallRegistry;
pub use types::{
    BackupPlan, DispatchConfig, Durability, NodeId, OpContext, OpResult, Operation,
    OperationCodec, OperationFrame, OperationHeader, PartitionId, PartitionRouter,
    ResponseFrame, ServiceRegistry, TaskContext, Transport,
};
