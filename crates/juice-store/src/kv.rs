use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use juice_core::error::JuiceError;

/// The key→bytes store the core persists through. Synchronous: storage is
/// never a suspension point, so lock-holding critical sections stay
/// suspend-free.
pub trait Kv: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, JuiceError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), JuiceError>;
    fn delete(&self, key: &str) -> Result<(), JuiceError>;
    /// All pairs whose key starts with `prefix`, key-ordered.
    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, JuiceError>;
}

// ── SledKv ───────────────────────────────────────────────────────────────────

/// Persistent store backed by sled (pure-Rust, no C dependencies).
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, JuiceError> {
        let db = sled::open(path).map_err(|e| JuiceError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), JuiceError> {
        self.db.flush().map_err(|e| JuiceError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl Kv for SledKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, JuiceError> {
        self.db
            .get(key.as_bytes())
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(|e| JuiceError::Storage(e.to_string()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), JuiceError> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| JuiceError::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), JuiceError> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| JuiceError::Storage(e.to_string()))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, JuiceError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item.map_err(|e| JuiceError::Storage(e.to_string()))?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|e| JuiceError::Storage(e.to_string()))?;
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }
}

// ── MemoryKv ─────────────────────────────────────────────────────────────────

/// In-memory store for tests and ephemeral engines.
#[derive(Default)]
pub struct MemoryKv {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Kv for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, JuiceError> {
        Ok(self.map.read().expect("kv lock").get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), JuiceError> {
        self.map
            .write()
            .expect("kv lock")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), JuiceError> {
        self.map.write().expect("kv lock").remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, JuiceError> {
        Ok(self
            .map
            .read()
            .expect("kv lock")
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
