//! Namespaced key-value abstraction with transactional updates.

use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Storage failures. Transient errors are retried by callers; fatal errors
/// surface and halt the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Write buffer inside a transactional update, with read-your-writes.
pub struct Txn<'a> {
    db: &'a dyn Database,
    writes: Vec<(String, Vec<u8>, Option<Vec<u8>>)>,
}

impl<'a> Txn<'a> {
    fn new(db: &'a dyn Database) -> Self {
        Txn {
            db,
            writes: Vec::new(),
        }
    }

    pub fn put(&mut self, ns: &str, key: &[u8], value: Vec<u8>) {
        self.writes.push((ns.to_string(), key.to_vec(), Some(value)));
    }

    pub fn delete(&mut self, ns: &str, key: &[u8]) {
        self.writes.push((ns.to_string(), key.to_vec(), None));
    }

    /// Read through the buffer first, then the database.
    pub fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        for (wns, wkey, value) in self.writes.iter().rev() {
            if wns == ns && wkey == key {
                return Ok(value.clone());
            }
        }
        self.db.get(ns, key)
    }
}

/// The injected KV contract. All keys live under a string namespace; `range`
/// scans a namespace by key prefix in ascending key order.
pub trait Database: Send + Sync {
    fn put(&self, ns: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn delete(&self, ns: &str, key: &[u8]) -> Result<(), StorageError>;
    fn range(&self, ns: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply a closure's writes atomically. The closure sees its own writes.
    fn update(
        &self,
        f: &mut dyn FnMut(&mut Txn<'_>) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;
}

/// In-memory [`Database`] over a sorted map.
#[derive(Default)]
pub struct MemDb {
    // Key layout: namespace bytes, 0x00 separator, user key. Namespaces do
    // not contain NUL so the separator is unambiguous.
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(ns: &str, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ns.len() + 1 + key.len());
        out.extend_from_slice(ns.as_bytes());
        out.push(0);
        out.extend_from_slice(key);
        out
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl Database for MemDb {
    fn put(&self, ns: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.map
            .write()
            .insert(Self::full_key(ns, key), value.to_vec());
        Ok(())
    }

    fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.read().get(&Self::full_key(ns, key)).cloned())
    }

    fn delete(&self, ns: &str, key: &[u8]) -> Result<(), StorageError> {
        self.map.write().remove(&Self::full_key(ns, key));
        Ok(())
    }

    fn range(&self, ns: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let start = Self::full_key(ns, prefix);
        let ns_prefix_len = ns.len() + 1;
        Ok(self
            .map
            .read()
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(&start))
            .map(|(k, v)| (k[ns_prefix_len..].to_vec(), v.clone()))
            .collect())
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut Txn<'_>) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let mut txn = Txn::new(self);
        f(&mut txn)?;
        let writes = txn.writes;
        let mut map = self.map.write();
        for (ns, key, value) in writes {
            let full = Self::full_key(&ns, &key);
            match value {
                Some(v) => {
                    map.insert(full, v);
                }
                None => {
                    map.remove(&full);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let db = MemDb::new();
        db.put("ns", b"k", b"v").unwrap();
        assert_eq!(db.get("ns", b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.get("other", b"k").unwrap(), None);
        db.delete("ns", b"k").unwrap();
        assert_eq!(db.get("ns", b"k").unwrap(), None);
    }

    #[test]
    fn range_scans_prefix_within_namespace() {
        let db = MemDb::new();
        db.put("a", b"x/1", b"1").unwrap();
        db.put("a", b"x/2", b"2").unwrap();
        db.put("a", b"y/1", b"3").unwrap();
        db.put("b", b"x/3", b"4").unwrap();

        let hits = db.range("a", b"x/").unwrap();
        assert_eq!(
            hits,
            vec![
                (b"x/1".to_vec(), b"1".to_vec()),
                (b"x/2".to_vec(), b"2".to_vec())
            ]
        );
    }

    #[test]
    fn update_is_atomic_with_read_your_writes() {
        let db = MemDb::new();
        db.put("ns", b"counter", b"1").unwrap();

        db.update(&mut |txn| {
            let current = txn.get("ns", b"counter")?.unwrap();
            txn.put("ns", b"counter", [current, b"1".to_vec()].concat());
            // The write is visible inside the transaction.
            assert_eq!(txn.get("ns", b"counter")?, Some(b"11".to_vec()));
            txn.put("ns", b"other", b"x".to_vec());
            Ok(())
        })
        .unwrap();

        assert_eq!(db.get("ns", b"counter").unwrap(), Some(b"11".to_vec()));
        assert_eq!(db.get("ns", b"other").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn failed_update_writes_nothing() {
        let db = MemDb::new();
        let result = db.update(&mut |txn| {
            txn.put("ns", b"k", b"v".to_vec());
            Err(StorageError::Transient("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.get("ns", b"k").unwrap(), None);
    }
}
