use super::{merge, Catalog, Competition};
use async_trait::async_trait;
use sdk::errors::EngineError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load and save the whole catalog document
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load(&self) -> Result<Catalog, EngineError>;
    async fn save(&self, catalog: &Catalog) -> Result<(), EngineError>;
}

/// Catalog kept as one JSON file
#[derive(Debug, Clone)]
pub struct JsonCatalogStore {
    path: PathBuf,
}

impl JsonCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogStore for JsonCatalogStore {
    /// A missing file is an empty catalog. A malformed one is an error and
    /// is left as it is on disk.
    async fn load(&self) -> Result<Catalog, EngineError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No catalog at {}, starting empty", self.path.display());
                return Ok(Catalog::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents).map_err(|e| {
            EngineError::CatalogMerge(format!(
                "{} is malformed: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn save(&self, catalog: &Catalog) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(catalog)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(
            "Saved catalog with {} competitions to {}",
            catalog.competitions.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Load, merge `incoming`, save
pub async fn upsert(store: &dyn CatalogStore, incoming: Competition) -> Result<Catalog, EngineError> {
    let catalog = merge(store.load().await?, incoming);
    store.save(&catalog).await?;
    Ok(catalog)
}
