use super::{safe_component, CacheEntry, CacheKey};
use sdk::errors::EngineError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One JSON file per cache key
///
/// Layout: `<root>/<kind>/<campaign>/<year>/<country>.json`. Writes go to a
/// temporary sibling first and are renamed into place, so a reader never
/// sees a half-written entry.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    root: PathBuf,
}

impl FileCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.kind.as_str())
            .join(safe_component(&key.campaign))
            .join(key.year.to_string())
            .join(format!("{}.json", safe_component(&key.country)))
    }

    /// Read the entry for `key`
    ///
    /// A malformed file, or one holding a different key after name
    /// sanitising, is logged and treated as absent.
    pub fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, EngineError> {
        let path = self.path_for(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<CacheEntry>(&contents) {
            Ok(entry) if entry.key == *key => Ok(Some(entry)),
            Ok(entry) => {
                warn!("Cache file for {} holds {}, ignoring", key, entry.key);
                Ok(None)
            }
            Err(e) => {
                warn!("Malformed cache file for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Every readable entry under the root
    ///
    /// Malformed files and leftover temporaries are skipped.
    pub fn load_all(&self) -> Result<Vec<CacheEntry>, EngineError> {
        let mut entries = Vec::new();
        let mut dirs = vec![self.root.clone()];

        while let Some(dir) = dirs.pop() {
            let listing = match fs::read_dir(&dir) {
                Ok(listing) => listing,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for item in listing {
                let path = item?.path();
                if path.is_dir() {
                    dirs.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let parsed = fs::read_to_string(&path)
                    .map_err(EngineError::from)
                    .and_then(|contents| {
                        serde_json::from_str::<CacheEntry>(&contents).map_err(EngineError::from)
                    });
                match parsed {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("Skipping cache file {}: {}", path.display(), e),
                }
            }
        }

        Ok(entries)
    }

    /// Write `entry`, replacing any previous one
    pub fn write(&self, entry: &CacheEntry) -> Result<(), EngineError> {
        let path = self.path_for(&entry.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKind;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(key: CacheKey) -> CacheEntry {
        CacheEntry {
            key,
            created_at: Utc::now(),
            payload: json!({"total_uploads": 100}),
        }
    }

    #[test]
    fn test_path_is_sharded() {
        let store = FileCacheStore::new("/cache");
        let key = CacheKey::new(CacheKind::Uploaders, "earth", 2024, "United Kingdom");
        assert_eq!(
            store.path_for(&key),
            PathBuf::from("/cache/uploaders/earth/2024/United_Kingdom.json")
        );
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp.path());
        let e = entry(CacheKey::country_detail("earth", 2024, "Germany"));

        store.write(&e).unwrap();
        assert_eq!(store.read(&e.key).unwrap(), Some(e.clone()));
        assert!(!store.path_for(&e.key).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_file_reads_none() {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp.path());
        let key = CacheKey::country_detail("earth", 2024, "Germany");
        assert_eq!(store.read(&key).unwrap(), None);
    }

    #[test]
    fn test_malformed_file_reads_none() {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp.path());
        let key = CacheKey::country_detail("earth", 2024, "Germany");
        let path = store.path_for(&key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        assert_eq!(store.read(&key).unwrap(), None);
    }

    #[test]
    fn test_load_all_skips_broken_files() {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp.path());
        let germany = entry(CacheKey::country_detail("earth", 2024, "Germany"));
        let chile = entry(CacheKey::uploaders("earth", 2023, "Chile"));
        store.write(&germany).unwrap();
        store.write(&chile).unwrap();

        let broken = store.path_for(&CacheKey::country_detail("earth", 2024, "Peru"));
        fs::write(&broken, "{not json").unwrap();
        fs::write(broken.with_extension("json.tmp"), "partial").unwrap();

        let mut keys: Vec<CacheKey> = store.load_all().unwrap().into_iter().map(|e| e.key).collect();
        keys.sort_by(|a, b| a.country.cmp(&b.country));
        assert_eq!(keys, vec![chile.key, germany.key]);
    }

    #[test]
    fn test_load_all_of_missing_root() {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp.path().join("absent"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_colliding_names_are_not_confused() {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp.path());
        let written = entry(CacheKey::country_detail("earth", 2024, "Côte d'Ivoire"));
        store.write(&written).unwrap();

        let other = CacheKey::country_detail("earth", 2024, "Côte d Ivoire");
        assert_eq!(store.path_for(&other), store.path_for(&written.key));
        assert_eq!(store.read(&other).unwrap(), None);
    }
}
