use std::{
    collections::{BTreeMap, HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    path::Path,
};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::Result;

/// path -> (fingerprint, last seen)
const FINGERPRINTS: TableDefinition<&str, (u64, u64)> =
    TableDefinition::new("fingerprints");

/// Cheap change proxy for a file: a hash of its path, size and mtime.
pub fn fingerprint(path: &str, size: u64, mtime_nanos: u128) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    size.hash(&mut hasher);
    mtime_nanos.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    fingerprint: u64,
    /// Logical clock value of the last `record`.
    last_seen: u64,
}

/// Bounded `path -> fingerprint` map that evicts the entry seen longest
/// ago once full.
#[derive(Debug, Clone)]
pub struct FingerprintCache {
    entries: HashMap<String, Entry>,
    by_age: BTreeMap<u64, String>,
    clock: u64,
    capacity: usize,
}

impl FingerprintCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_age: BTreeMap::new(),
            clock: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, path: &str) -> Option<u64> {
        self.entries.get(path).map(|e| e.fingerprint)
    }

    /// Whether `path` was last recorded with exactly `fingerprint`.
    pub fn is_unchanged(&self, path: &str, fingerprint: u64) -> bool {
        self.get(path) == Some(fingerprint)
    }

    pub fn record(&mut self, path: &str, fingerprint: u64) {
        self.clock += 1;
        self.insert_at(path.to_string(), fingerprint, self.clock);
    }

    fn insert_at(&mut self, path: String, fingerprint: u64, last_seen: u64) {
        if let Some(old) = self.entries.remove(&path) {
            self.by_age.remove(&old.last_seen);
        }
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.by_age.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.by_age.insert(last_seen, path.clone());
        self.entries.insert(
            path,
            Entry {
                fingerprint,
                last_seen,
            },
        );
    }

    pub fn remove(&mut self, path: &str) -> bool {
        match self.entries.remove(path) {
            Some(old) => {
                self.by_age.remove(&old.last_seen);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_age.clear();
    }

    /// Load the newest `capacity` entries persisted at `db_path`.
    pub fn load(db_path: &Path, capacity: usize) -> Result<Self> {
        let mut cache = Self::new(capacity);
        if !db_path.exists() {
            return Ok(cache);
        }
        let db = Database::create(db_path)?;
        let txn = db.begin_read()?;
        let table = match txn.open_table(FINGERPRINTS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(cache),
            Err(e) => return Err(e.into()),
        };

        let mut rows: Vec<(u64, String, u64)> = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let (fingerprint, last_seen) = v.value();
            rows.push((last_seen, k.value().to_string(), fingerprint));
        }
        rows.sort_unstable_by_key(|(last_seen, _, _)| *last_seen);
        for (last_seen, path, fingerprint) in rows {
            cache.insert_at(path, fingerprint, last_seen);
            cache.clock = cache.clock.max(last_seen);
        }
        Ok(cache)
    }

    /// Replace whatever is persisted at `db_path` with this cache.
    pub fn save(&self, db_path: &Path) -> Result<()> {
        let db = Database::create(db_path)?;
        let txn = db.begin_write()?;
        txn.delete_table(FINGERPRINTS)?;
        {
            let mut table = txn.open_table(FINGERPRINTS)?;
            for (path, entry) in &self.entries {
                table.insert(
                    path.as_str(),
                    (entry.fingerprint, entry.last_seen),
                )?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}
