//! Package loader and cache
//!
//! Archives live at `{root}/{id}/{id}.{version}.zip`. Published versions are
//! immutable, so a loaded package is cached by `(id, version)`; the
//! `develop` version is mutable and reloaded on every lookup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use rhai::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::compile::compile_engine;
use crate::error::LoadError;
use crate::package::{ModulePackage, DEVELOP_VERSION};

static MODULE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+$").unwrap_or_else(|_| unreachable!("literal regex")));
static MODULE_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(dir-)?[a-f0-9]+$|^develop$|^internal$").unwrap_or_else(|_| unreachable!("literal regex"))
});

/// Loader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directory holding one subdirectory per module id
    pub root: PathBuf,
    /// Most packages kept in memory
    pub cache_capacity: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("modules"),
            cache_capacity: 64,
        }
    }
}

impl LoaderConfig {
    /// Load packages from `root`
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Keep at most `cache_capacity` packages
    #[must_use]
    pub fn with_cache_capacity(mut self, cache_capacity: u64) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }
}

/// Check an id and version before they become a path
///
/// # Errors
///
/// Returns [`LoadError::InvalidName`] for anything outside the allowed
/// alphabets.
pub fn validate_name(id: &str, version: &str) -> Result<(), LoadError> {
    if !MODULE_ID.is_match(id) {
        return Err(LoadError::InvalidName(format!("module id {id:?}")));
    }
    if !MODULE_VERSION.is_match(version) {
        return Err(LoadError::InvalidName(format!("module version {version:?}")));
    }
    Ok(())
}

/// Path of the archive for `(id, version)` under `root`
#[must_use]
pub fn archive_path(root: &Path, id: &str, version: &str) -> PathBuf {
    root.join(id).join(format!("{id}.{version}.zip"))
}

/// Resolves, validates, compiles and caches packages
pub struct PackageLoader {
    root: PathBuf,
    engine: Engine,
    cache: Cache<(String, String), Arc<ModulePackage>>,
}

impl std::fmt::Debug for PackageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageLoader")
            .field("root", &self.root)
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl PackageLoader {
    /// Create a loader
    #[must_use]
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            root: config.root.clone(),
            engine: compile_engine(),
            cache: Cache::new(config.cache_capacity),
        }
    }

    /// Package directory root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load `(id, version)`, from cache when possible
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::InvalidName`] before touching the filesystem,
    /// [`LoadError::NotFound`] for a missing archive, and the archive, spec
    /// and compile errors of [`ModulePackage::from_archive`].
    #[instrument(skip(self))]
    pub async fn load(&self, id: &str, version: &str) -> Result<Arc<ModulePackage>, LoadError> {
        validate_name(id, version)?;
        if version == DEVELOP_VERSION {
            return self.load_uncached(id, version).await.map(Arc::new);
        }

        let key = (id.to_string(), version.to_string());
        if let Some(cached) = self.cache.get(&key).await {
            debug!("package cache hit");
            return Ok(cached);
        }
        let package = Arc::new(self.load_uncached(id, version).await?);
        self.cache.insert(key, Arc::clone(&package)).await;
        Ok(package)
    }

    async fn load_uncached(&self, id: &str, version: &str) -> Result<ModulePackage, LoadError> {
        let path = archive_path(&self.root, id, version);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound {
                    id: id.to_string(),
                    version: version.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let package = ModulePackage::from_archive(&self.engine, id, version, &bytes)?;
        info!(id, version, path = %path.display(), "package loaded");
        Ok(package)
    }

    /// Drop a cached package
    pub async fn invalidate(&self, id: &str, version: &str) {
        self.cache.invalidate(&(id.to_string(), version.to_string())).await;
    }

    /// Approximate number of cached packages
    #[inline]
    #[must_use]
    pub fn cached_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(validate_name("double", "0123abcdef").is_ok());
        assert!(validate_name("my-mod_2", "dir-abc").is_ok());
        assert!(validate_name("double", "develop").is_ok());
        assert!(validate_name("double", "internal").is_ok());

        assert!(validate_name("Double", "abc").is_err());
        assert!(validate_name("../etc", "abc").is_err());
        assert!(validate_name("double", "v1.0").is_err());
        assert!(validate_name("double", "").is_err());
        assert!(validate_name("", "abc").is_err());
    }

    #[test]
    fn archive_layout() {
        assert_eq!(
            archive_path(Path::new("/m"), "double", "abc"),
            PathBuf::from("/m/double/double.abc.zip")
        );
    }
}
