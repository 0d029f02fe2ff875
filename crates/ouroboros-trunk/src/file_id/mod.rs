//! Concurrent file-id table with FIFO expiry
//!
//! Remembers recently seen file ids for a fixed grace period so duplicate
//! uploads inside that window are rejected.
//!
//! ## Layout
//!
//! - A fixed number of hash buckets, guarded by a smaller number of shard
//!   locks: bucket `b` belongs to shard `b % lock_count`. Each shard owns the
//!   records of its buckets in a generational slot map; bucket chains link
//!   records by slot index and are kept in ascending hash order.
//! - A global expiry queue, under its own lock, holding the key of every live
//!   record in insertion order.
//!
//! A shard lock is always released before the queue lock is taken; the two
//! are never held together.
//!
//! ## Expiry invariant
//!
//! Every record gets the same grace period and its deadline is stamped under
//! the queue lock, so queue order is deadline order. The sweep pops from the
//! head and stops at the first live record. Variable TTLs would break this
//! and need a priority structure instead.

mod slots;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::FileIdConfig;
use crate::error::{Result, TrunkError};
use crate::scheduler::{ScheduleEntry, CLEAR_EXPIRED_FILE_ID_TASK_ID};
use slots::{SlotKey, SlotMap};

const NIL: u32 = u32::MAX;

struct FileIdRecord {
    file_id: Box<[u8]>,
    hash_code: u32,
    next: u32,
}

struct Shard {
    /// Chain heads of the buckets owned by this shard, by `bucket / lock_count`
    heads: Vec<u32>,
    records: SlotMap<FileIdRecord>,
}

#[derive(Debug, Clone, Copy)]
struct RecordKey {
    shard: u32,
    slot: SlotKey,
}

#[derive(Debug)]
struct ExpiryItem {
    key: RecordKey,
    expires: i64,
}

/// Sharded set of recently seen file ids
pub struct FileIdTable {
    shards: Vec<Mutex<Shard>>,
    expiry: Mutex<VecDeque<ExpiryItem>>,
    bucket_count: usize,
    grace_period: i64,
    clock: Arc<dyn Clock>,
    len: AtomicUsize,
}

impl FileIdTable {
    pub fn new(config: &FileIdConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.bucket_count == 0 || config.lock_count == 0 {
            return Err(TrunkError::InvalidArgument(
                "bucket_count and lock_count must be > 0".into(),
            ));
        }
        if config.grace_period_secs <= 0 {
            return Err(TrunkError::InvalidArgument(
                "grace_period_secs must be > 0".into(),
            ));
        }

        let lock_count = config.lock_count.min(config.bucket_count);
        let shards = (0..lock_count)
            .map(|shard| {
                // Buckets shard, shard + lock_count, shard + 2 * lock_count, ...
                let owned = (config.bucket_count - shard + lock_count - 1) / lock_count;
                Mutex::new(Shard {
                    heads: vec![NIL; owned],
                    records: SlotMap::new(),
                })
            })
            .collect();

        debug!(
            "File-id table: {} buckets, {} locks, grace period {}s",
            config.bucket_count, lock_count, config.grace_period_secs
        );

        Ok(Self {
            shards,
            expiry: Mutex::new(VecDeque::new()),
            bucket_count: config.bucket_count,
            grace_period: config.grace_period_secs,
            clock,
            len: AtomicUsize::new(0),
        })
    }

    /// Register `file_id`.
    ///
    /// Returns `AlreadyExists` if it is still inside its grace period; the
    /// existing deadline is not refreshed.
    pub fn add(&self, file_id: &[u8]) -> Result<()> {
        let hash_code = simple_hash(file_id);
        let (shard_idx, local) = self.locate(hash_code);

        let slot = {
            let mut guard = self.shards[shard_idx].lock();
            let shard = &mut *guard;

            let mut previous = NIL;
            let mut current = shard.heads[local];
            while let Some(record) = shard.records.at(current) {
                if hash_code < record.hash_code {
                    break;
                }
                if hash_code == record.hash_code && *record.file_id == *file_id {
                    return Err(TrunkError::AlreadyExists);
                }
                previous = current;
                current = record.next;
            }

            let slot = shard.records.insert(FileIdRecord {
                file_id: file_id.into(),
                hash_code,
                next: current,
            });
            match shard.records.at_mut(previous) {
                Some(record) => record.next = slot.index,
                None => shard.heads[local] = slot.index,
            }
            slot
        };

        self.len.fetch_add(1, Ordering::Relaxed);

        let mut expiry = self.expiry.lock();
        expiry.push_back(ExpiryItem {
            key: RecordKey {
                shard: shard_idx as u32,
                slot,
            },
            expires: self.clock.now() + self.grace_period,
        });
        Ok(())
    }

    pub fn contains(&self, file_id: &[u8]) -> bool {
        let hash_code = simple_hash(file_id);
        let (shard_idx, local) = self.locate(hash_code);
        let shard = self.shards[shard_idx].lock();

        let mut current = shard.heads[local];
        while let Some(record) = shard.records.at(current) {
            if hash_code < record.hash_code {
                return false;
            }
            if hash_code == record.hash_code && *record.file_id == *file_id {
                return true;
            }
            current = record.next;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record whose deadline has passed. Returns how many went.
    pub fn clear_expired(&self) -> usize {
        let now = self.clock.now();

        let expired: Vec<RecordKey> = {
            let mut expiry = self.expiry.lock();
            let mut keys = Vec::new();
            while let Some(item) = expiry.front() {
                if item.expires >= now {
                    break;
                }
                keys.push(item.key);
                expiry.pop_front();
            }
            keys
        };

        let mut removed = 0;
        for key in &expired {
            match self.delete(*key) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to delete expired file id {:?}: {}", key, e),
            }
        }

        if removed > 0 {
            debug!("Cleared {} expired file ids", removed);
        }
        removed
    }

    /// Schedule entry running [`FileIdTable::clear_expired`] every second
    pub fn expiry_entry(table: Arc<FileIdTable>) -> ScheduleEntry {
        ScheduleEntry::new(CLEAR_EXPIRED_FILE_ID_TASK_ID, 1, move || {
            table.clear_expired();
            Ok(())
        })
    }

    fn delete(&self, key: RecordKey) -> Result<()> {
        let mut guard = self.shards[key.shard as usize].lock();
        let shard = &mut *guard;

        let hash_code = match shard.records.get(key.slot) {
            Some(record) => record.hash_code,
            None => return Err(TrunkError::NotFound),
        };
        let (_, local) = self.locate(hash_code);

        let mut previous = NIL;
        let mut current = shard.heads[local];
        while let Some(record) = shard.records.at(current) {
            if current == key.slot.index {
                break;
            }
            if hash_code < record.hash_code {
                return Err(TrunkError::NotFound);
            }
            previous = current;
            current = record.next;
        }
        if current != key.slot.index {
            return Err(TrunkError::NotFound);
        }

        let next = match shard.records.remove(key.slot) {
            Some(record) => record.next,
            None => return Err(TrunkError::NotFound),
        };
        match shard.records.at_mut(previous) {
            Some(record) => record.next = next,
            None => shard.heads[local] = next,
        }

        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Shard index and the bucket's position inside that shard
    fn locate(&self, hash_code: u32) -> (usize, usize) {
        let bucket = hash_code as usize % self.bucket_count;
        let lock_count = self.shards.len();
        (bucket % lock_count, bucket / lock_count)
    }
}

/// 32-bit FNV-1a
fn simple_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
