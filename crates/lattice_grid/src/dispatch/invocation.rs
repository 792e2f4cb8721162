//! Invocation construction and the routed dispatch-with-retry path.
//!
//! An invocation is one configured dispatch of an operation to a resolved
//! target. Local targets run inline through the executor; remote targets
//! register a call, encode the operation, and send it. Retryable failures
//! are retried up to the try count, re-resolving the target each attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;

use super::error::OpError;
use super::executor::{self, ResponseSink};
use super::node::NodeDispatch;
use super::types::{
    NodeId, OpResult, Operation, OperationFrame, OperationHeader, PartitionId, TaskContext,
};

/// Configures one dispatch of an operation.
///
/// Obtained from [`NodeDispatch::invocation_builder`]; defaults come from the
/// node's [`DispatchConfig`](super::types::DispatchConfig).
pub struct InvocationBuilder {
    node: NodeDispatch,
    service: String,
    operation: Arc<dyn Operation>,
    partition_id: Option<PartitionId>,
    replica_index: usize,
    target: Option<NodeId>,
    try_count: u32,
    try_pause: Duration,
    response_timeout: Duration,
    task: TaskContext,
}

impl InvocationBuilder {
    pub(crate) fn new(
        node: NodeDispatch,
        service: &str,
        operation: Arc<dyn Operation>,
        partition_id: Option<PartitionId>,
    ) -> Self {
        let config = node.config();
        let try_count = config.default_try_count;
        let try_pause = config.default_try_pause();
        let response_timeout = config.call_timeout();
        Self {
            node,
            service: service.to_string(),
            operation,
            partition_id,
            replica_index: 0,
            target: None,
            try_count,
            try_pause,
            response_timeout,
            task: TaskContext::default(),
        }
    }

    /// Dispatch to an explicit target instead of resolving the partition
    /// owner.
    pub fn target(mut self, target: NodeId) -> Self {
        self.target = Some(target);
        self
    }

    /// Dispatch to the replica at this index (0 = owner).
    pub fn replica_index(mut self, replica_index: usize) -> Self {
        self.replica_index = replica_index;
        self
    }

    pub fn try_count(mut self, try_count: u32) -> Self {
        self.try_count = try_count.max(1);
        self
    }

    pub fn try_pause(mut self, try_pause: Duration) -> Self {
        self.try_pause = try_pause;
        self
    }

    /// Deadline for one remote response.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Thread the calling task's execution context through this invocation
    /// so nested key-scoped calls are detected.
    pub fn task_context(mut self, task: &TaskContext) -> Self {
        self.task = task.clone();
        self
    }

    pub fn build(self) -> Result<Invocation, OpError> {
        if self.operation.partition_scoped() && self.partition_id.is_none() {
            return Err(OpError::Configuration {
                detail: format!(
                    "operation of service {} is partition-scoped but no partition id was given",
                    self.service
                ),
            });
        }
        Ok(Invocation {
            node: self.node,
            service: self.service,
            operation: self.operation,
            partition_id: self.partition_id,
            replica_index: self.replica_index,
            target: self.target,
            try_count: self.try_count.max(1),
            try_pause: self.try_pause,
            response_timeout: self.response_timeout,
            task: self.task,
        })
    }
}

/// One configured dispatch, retried up to its try count.
pub struct Invocation {
    node: NodeDispatch,
    service: String,
    operation: Arc<dyn Operation>,
    partition_id: Option<PartitionId>,
    replica_index: usize,
    target: Option<NodeId>,
    try_count: u32,
    try_pause: Duration,
    response_timeout: Duration,
    task: TaskContext,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("service", &self.service)
            .field("partition_id", &self.partition_id)
            .field("replica_index", &self.replica_index)
            .field("target", &self.target)
            .field("try_count", &self.try_count)
            .field("try_pause", &self.try_pause)
            .field("response_timeout", &self.response_timeout)
            .field("task", &self.task)
            .finish()
    }
}

impl Invocation {
    /// Dispatch the operation, retrying retryable failures with the
    /// configured pause, and return the final result.
    pub async fn invoke(self) -> OpResult {
        // A key-scoped operation must not issue another key-scoped call from
        // its own execution context: the nested call could re-enter the key
        // lock bank or deadlock across nodes. Backups are controlled
        // internal traffic and exempt.
        if self.operation.key_hash().is_some() && !self.operation.is_backup() {
            if let Some(current) = self.task.in_key_operation() {
                return Err(OpError::NestedKeyInvocation {
                    current: current.to_string(),
                    requested: self.service.clone(),
                });
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.invoke_once().await {
                Err(err) if err.is_retryable() && attempt < self.try_count => {
                    debug!(
                        service = %self.service,
                        attempt,
                        try_count = self.try_count,
                        error = %err,
                        "invocation attempt failed, retrying"
                    );
                    time::sleep(self.try_pause).await;
                }
                result => return result,
            }
        }
    }

    /// One attempt: resolve the target, then run inline or send remotely.
    async fn invoke_once(&self) -> OpResult {
        let target = match self.target {
            Some(target) => Some(target),
            None => self
                .partition_id
                .and_then(|p| self.node.router().replica_address(p, self.replica_index)),
        };
        let Some(target) = target else {
            return Err(OpError::WrongTarget {
                this: self.node.local_id(),
                expected: None,
                partition: self.partition_id,
                service: self.service.clone(),
            });
        };

        if !self.operation.is_join() && !self.node.router().is_member(target) {
            return Err(OpError::NotAMember { target });
        }

        let header = OperationHeader {
            service: self.service.clone(),
            partition_id: self.partition_id,
            replica_index: self.replica_index,
            caller: self.node.local_id(),
            call_id: 0,
        };

        if target == self.node.local_id() {
            self.invoke_local(header).await
        } else {
            self.invoke_remote(target, header).await
        }
    }

    async fn invoke_local(&self, header: OperationHeader) -> OpResult {
        let (tx, rx) = oneshot::channel();
        executor::execute(
            &self.node,
            self.operation.clone(),
            header,
            ResponseSink::Local(tx),
        )
        .await;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(OpError::other("local response slot dropped")),
        }
    }

    async fn invoke_remote(&self, target: NodeId, header: OperationHeader) -> OpResult {
        let payload = self
            .node
            .codec()
            .encode(self.operation.as_ref())
            .map_err(OpError::from)?;

        let (call_id, rx) = self.node.registry().register(target);
        let frame = OperationFrame {
            service: header.service,
            payload,
            partition_id: header.partition_id,
            replica_index: header.replica_index,
            call_id,
            caller: header.caller,
        };

        if !self.node.transport().send_operation(target, frame).await {
            self.node.registry().deregister(call_id);
            return Err(OpError::SendFailure { target });
        }

        match time::timeout(self.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OpError::other("call slot dropped before completion")),
            Err(_) => {
                self.node.registry().deregister(call_id);
                Err(OpError::Timeout {
                    what: format!("remote response from node {target}"),
                })
            }
        }
    }
}
