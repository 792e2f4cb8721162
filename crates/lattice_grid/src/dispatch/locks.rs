//! Partition and key lock banks.
//!
//! One read/write lock pair per partition, plus a fixed bank of key mutexes
//! addressed by `hash % N`. The key bank is approximate and
//! collision-tolerant: two keys hashing to the same slot serialize against
//! each other. Guards are owned so they can be held across awaits while
//! backups are taken.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::types::PartitionId;

/// Outcome of a non-blocking partition read-lock attempt.
pub enum TryReadPartition {
    Acquired(OwnedRwLockReadGuard<()>),
    /// The write lock is held: a migration is in flight.
    Migrating,
}

/// Fixed banks of partition and key locks, sized once at startup.
pub struct LockTable {
    partitions: Vec<Arc<RwLock<()>>>,
    keys: Vec<Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new(partition_count: u64, key_lock_count: usize) -> Self {
        let partitions = (0..partition_count)
            .map(|_| Arc::new(RwLock::new(())))
            .collect();
        let keys = (0..key_lock_count.max(1))
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        Self { partitions, keys }
    }

    pub fn partition_count(&self) -> u64 {
        self.partitions.len() as u64
    }

    fn partition(&self, partition: PartitionId) -> Option<Arc<RwLock<()>>> {
        self.partitions.get(partition as usize).cloned()
    }

    /// Acquire the partition's exclusive write lock, blocking until granted.
    /// `None` means the partition id is out of range.
    pub async fn lock_partition_write(
        &self,
        partition: PartitionId,
    ) -> Option<OwnedRwLockWriteGuard<()>> {
        let lock = self.partition(partition)?;
        Some(lock.write_owned().await)
    }

    /// Attempt the partition's shared read lock without blocking. `None`
    /// means the partition id is out of range.
    pub fn try_lock_partition_read(&self, partition: PartitionId) -> Option<TryReadPartition> {
        let lock = self.partition(partition)?;
        match lock.try_read_owned() {
            Ok(guard) => Some(TryReadPartition::Acquired(guard)),
            Err(_) => Some(TryReadPartition::Migrating),
        }
    }

    /// Acquire the key lock for `key_hash`, blocking until granted. The slot
    /// is `key_hash % bank_size`; collisions serialize unrelated keys.
    pub async fn lock_key(&self, key_hash: u64) -> OwnedMutexGuard<()> {
        let slot = (key_hash % self.keys.len() as u64) as usize;
        self.keys[slot].clone().lock_owned().await
    }
}
