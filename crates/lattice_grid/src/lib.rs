//! Per-node operation dispatch core for a partitioned in-memory data grid.
//!
//! This crate decides whether a unit of work runs on the local node or is
//! forwarded to the partition owner, tracks in-flight remote invocations,
//! serializes conflicting work through partition- and key-level lock banks,
//! and propagates mutations to backup replicas. Higher layers supply a
//! `PartitionRouter`, an `OperationCodec`, a `Transport`, and a
//! `ServiceRegistry`, then drive work through `NodeDispatch`.

pub mod dispatch;
