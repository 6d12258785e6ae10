//! Small synchronous key-value slots with a byte quota.
//!
//! This is the lowest persistence layer: the key-value adapter and the audit
//! log both keep one JSON document per key here. Writes that would push the
//! total stored size over the quota fail with [`KvError::QuotaExceeded`] and
//! leave the previous value in place.

use dashmap::DashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors from a key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("quota exceeded: writing {needed} bytes would exceed {quota} bytes")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io(err.to_string())
    }
}

/// A string-valued key-value store.
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    fn remove(&self, key: &str) -> Result<(), KvError>;
    /// Bytes currently stored across all keys.
    fn used_bytes(&self) -> usize;
}

/// In-memory store with a byte quota.
#[derive(Debug)]
pub struct MemoryKv {
    slots: DashMap<String, String>,
    quota: usize,
}

impl MemoryKv {
    pub fn new(quota: usize) -> Self {
        Self {
            slots: DashMap::new(),
            quota,
        }
    }

    /// A store without a practical quota.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.slots.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let others: usize = self
            .slots
            .iter()
            .filter(|e| e.key() != key)
            .map(|e| e.value().len())
            .sum();
        let needed = others.saturating_add(value.len());
        if needed > self.quota {
            return Err(KvError::QuotaExceeded {
                needed,
                quota: self.quota,
            });
        }
        self.slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.slots.remove(key);
        Ok(())
    }

    fn used_bytes(&self) -> usize {
        self.slots.iter().map(|e| e.value().len()).sum()
    }
}

/// One file per key under a directory, with a byte quota.
#[derive(Debug)]
pub struct FileKv {
    dir: PathBuf,
    quota: usize,
    sizes: DashMap<String, usize>,
}

impl FileKv {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, quota: usize) -> Result<Self, KvError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let sizes = DashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(key) = name.strip_suffix(".json") {
                sizes.insert(key.to_string(), entry.metadata()?.len() as usize);
            }
        }

        Ok(Self { dir, quota, sizes })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// Injective key-to-filename mapping: ASCII alphanumerics and `-` stay,
/// every other byte becomes `_` plus two hex digits.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let stem = file_stem(key);
        let others: usize = self
            .sizes
            .iter()
            .filter(|e| *e.key() != stem)
            .map(|e| *e.value())
            .sum();
        let needed = others.saturating_add(value.len());
        if needed > self.quota {
            return Err(KvError::QuotaExceeded {
                needed,
                quota: self.quota,
            });
        }

        // Write to a sibling temp file, then rename over the target.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.sizes.insert(stem, value.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.sizes.remove(&file_stem(key));
        Ok(())
    }

    fn used_bytes(&self) -> usize {
        self.sizes.iter().map(|e| *e.value()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_roundtrip() {
        let kv = MemoryKv::unbounded();
        assert_eq!(kv.get("a").unwrap(), None);
        kv.set("a", "[1,2]").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("[1,2]"));
        kv.remove("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
    }

    #[test]
    fn memory_quota_counts_other_keys() {
        let kv = MemoryKv::new(10);
        kv.set("a", "12345").unwrap();
        // Overwriting the same key only counts the new value.
        kv.set("a", "1234567890").unwrap();
        kv.set("a", "123").unwrap();

        let err = kv.set("b", "12345678").unwrap_err();
        assert_eq!(err, KvError::QuotaExceeded { needed: 11, quota: 10 });
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("123"));
        assert_eq!(kv.get("b").unwrap(), None);
        assert_eq!(kv.used_bytes(), 3);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = FileKv::open(dir.path(), 1024).unwrap();
            kv.set("app:clients", "[{\"id\":\"c-1\"}]").unwrap();
        }

        let kv = FileKv::open(dir.path(), 1024).unwrap();
        assert_eq!(
            kv.get("app:clients").unwrap().as_deref(),
            Some("[{\"id\":\"c-1\"}]")
        );
        assert_eq!(kv.used_bytes(), 14);
    }

    #[test]
    fn file_store_enforces_quota() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::open(dir.path(), 8).unwrap();
        kv.set("k", "1234").unwrap();
        assert!(matches!(
            kv.set("j", "123456"),
            Err(KvError::QuotaExceeded { .. })
        ));
        kv.remove("k").unwrap();
        kv.set("j", "123456").unwrap();
    }

    #[test]
    fn similar_keys_get_separate_files() {
        assert_eq!(file_stem("app:clients"), "app_3aclients");
        assert_eq!(file_stem("ns_a"), "ns_5fa");

        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::open(dir.path(), 1024).unwrap();
        kv.set("ns:a", "colon").unwrap();
        kv.set("ns_a", "underscore").unwrap();
        kv.set("ns/a", "slash").unwrap();

        assert_eq!(kv.get("ns:a").unwrap().as_deref(), Some("colon"));
        assert_eq!(kv.get("ns_a").unwrap().as_deref(), Some("underscore"));
        assert_eq!(kv.get("ns/a").unwrap().as_deref(), Some("slash"));
        assert_eq!(kv.used_bytes(), 20);
    }
}
