// Storage abstraction for ordered, batch-atomic persistence
//
// Every record and index entry lives in one keyspace so that a single batch
// can cover a record, its index entries and any cascaded records.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Ordered key/value engine with all-or-nothing batches.
///
/// Scans return entries in ascending key order. `scan_after` walks the keys
/// under `prefix` strictly after `after` in the requested direction.
#[cfg_attr(test, mockall::automock)]
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String>;
    fn scan_after(
        &self,
        prefix: &[u8],
        after: Option<Vec<u8>>,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String>;
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String>;
    fn apply_batch(&self, ops: Vec<WriteOp>) -> Result<(), String>;
    /// Sum of key and value lengths currently held.
    fn used_bytes(&self) -> u64;
    fn flush(&self) -> Result<(), String>;
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_upper_bound(prefix: &[u8]) -> Bound<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Bound::Excluded(end);
        }
    }
    Bound::Unbounded
}

/// Range bounds for `scan_after`, or `None` when `after` lies outside `prefix`.
fn scan_bounds(
    prefix: &[u8],
    after: Option<Vec<u8>>,
    reverse: bool,
) -> Option<(Bound<Vec<u8>>, Bound<Vec<u8>>)> {
    if after.as_ref().is_some_and(|a| !a.starts_with(prefix)) {
        return None;
    }
    let bounds = match (reverse, after) {
        (false, None) => (Bound::Included(prefix.to_vec()), prefix_upper_bound(prefix)),
        (false, Some(after)) => (Bound::Excluded(after), prefix_upper_bound(prefix)),
        (true, None) => (Bound::Included(prefix.to_vec()), prefix_upper_bound(prefix)),
        (true, Some(after)) => (Bound::Included(prefix.to_vec()), Bound::Excluded(after)),
    };
    Some(bounds)
}

fn entry_size(key: &[u8], value_len: usize) -> u64 {
    (key.len() + value_len) as u64
}

/// Net change in `used_bytes` if `ops` were applied in order.
///
/// `current` reports the value length presently stored under a key.
pub fn batch_size_delta<F>(ops: &[WriteOp], mut current: F) -> Result<i64, String>
where
    F: FnMut(&[u8]) -> Result<Option<usize>, String>,
{
    let mut overlay: HashMap<&[u8], Option<usize>> = HashMap::new();
    let mut delta = 0i64;
    for op in ops {
        let key = op.key();
        let before = match overlay.get(key) {
            Some(len) => *len,
            None => current(key)?,
        };
        let after = match op {
            WriteOp::Put { value, .. } => Some(value.len()),
            WriteOp::Delete { .. } => None,
        };
        delta -= before.map_or(0, |len| entry_size(key, len) as i64);
        delta += after.map_or(0, |len| entry_size(key, len) as i64);
        overlay.insert(key, after);
    }
    Ok(delta)
}

/// Projected `used_bytes` after `ops`, without applying them.
pub fn projected_usage(backend: &dyn StorageBackend, ops: &[WriteOp]) -> Result<u64, String> {
    let delta = batch_size_delta(ops, |key| Ok(backend.get(key)?.map(|v| v.len())))?;
    Ok((backend.used_bytes() as i64 + delta).max(0) as u64)
}

/// In-memory storage useful for testing and ephemeral sessions
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    used: Arc<AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        self.scan_after(prefix, None, false, usize::MAX)
    }

    fn scan_after(
        &self,
        prefix: &[u8],
        after: Option<Vec<u8>>,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let Some(bounds) = scan_bounds(prefix, after, reverse) else {
            return Ok(Vec::new());
        };
        let data = self.data.read();
        let range = data.range::<Vec<u8>, _>(bounds);
        let matching = |(k, _): &(&Vec<u8>, &Vec<u8>)| k.starts_with(prefix);
        let results = if reverse {
            range
                .rev()
                .filter(matching)
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            range
                .filter(matching)
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String> {
        Ok(self
            .data
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count())
    }

    fn apply_batch(&self, ops: Vec<WriteOp>) -> Result<(), String> {
        let mut data = self.data.write();
        let mut used = self.used.load(Ordering::SeqCst);
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    let key_len = key.len();
                    used += entry_size(&key, value.len());
                    if let Some(old) = data.insert(key, value) {
                        used = used.saturating_sub((key_len + old.len()) as u64);
                    }
                }
                WriteOp::Delete { key } => {
                    if let Some(old) = data.remove(&key) {
                        used = used.saturating_sub(entry_size(&key, old.len()));
                    }
                }
            }
        }
        self.used.store(used, Ordering::SeqCst);
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

const LOCK_RETRY_ATTEMPTS: u32 = 100;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// A previous handle on the same directory can keep the file lock for a
/// moment after it is dropped.
fn is_lock_contention(err: &sled::Error) -> bool {
    match err {
        sled::Error::Io(io) => {
            io.kind() == std::io::ErrorKind::WouldBlock
                || io.to_string().contains("could not acquire lock")
        }
        _ => false,
    }
}

/// On-disk storage backed by a single sled tree.
pub struct SledStorage {
    db: sled::Db,
    used: AtomicU64,
}

impl SledStorage {
    /// Open or create the database, waiting briefly for a lock held by a
    /// handle that is still shutting down.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let mut attempt = 0;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(e) if is_lock_contention(&e) && attempt < LOCK_RETRY_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %e, "Database still locked, retrying");
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(e.to_string()),
            }
        };
        let mut used = 0u64;
        for item in db.iter() {
            let (k, v) = item.map_err(|e| e.to_string())?;
            used += entry_size(&k, v.len());
        }
        Ok(Self {
            db,
            used: AtomicU64::new(used),
        })
    }
}

impl StorageBackend for SledStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| e.to_string())?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn scan_after(
        &self,
        prefix: &[u8],
        after: Option<Vec<u8>>,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let Some(bounds) = scan_bounds(prefix, after, reverse) else {
            return Ok(Vec::new());
        };
        let range = self.db.range::<Vec<u8>, _>(bounds);
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> = if reverse {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        let mut results = Vec::new();
        for item in iter {
            if results.len() >= limit {
                break;
            }
            let (k, v) = item.map_err(|e| e.to_string())?;
            if k.starts_with(prefix) {
                results.push((k.to_vec(), v.to_vec()));
            }
        }
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String> {
        Ok(self.db.scan_prefix(prefix).count())
    }

    fn apply_batch(&self, ops: Vec<WriteOp>) -> Result<(), String> {
        let delta = batch_size_delta(&ops, |key| {
            let value = self.db.get(key).map_err(|e| e.to_string())?;
            Ok(value.map(|v| v.len()))
        })?;

        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.insert(key, value),
                WriteOp::Delete { key } => batch.remove(key),
            }
        }
        self.db.apply_batch(batch).map_err(|e| e.to_string())?;

        if delta >= 0 {
            self.used.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            let shrink = delta.unsigned_abs();
            let _ = self
                .used
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    Some(used.saturating_sub(shrink))
                });
        }
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn flush(&self) -> Result<(), String> {
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}
