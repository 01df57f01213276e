//! Discovery backed by an inventory file.
//!
//! The inventory is a JSON document:
//!
//! ```json
//! {
//!   "resources": [
//!     {"type": "Microsoft.Network/virtualNetworks", "name": "vnet-hub",
//!      "scope": "rg-prod", "provisioning_state": "Succeeded",
//!      "properties": {"addressSpace": {"addressPrefixes": ["10.0.0.0/16"]}}}
//!   ],
//!   "relationships": [
//!     {"dependent": {"resource_type": "Microsoft.Network/virtualNetworks", "name": "vnet-hub"},
//!      "dependency": {"resource_type": "Microsoft.Resources/resourceGroups", "name": "rg-prod"},
//!      "kind": "contained_in"}
//!   ]
//! }
//! ```
//!
//! The file is re-read on every lookup so that resources created by earlier
//! operations become visible. Wrap it in [`CachedDiscovery`] to bound reads.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use workflow::{Discovery, Relationship, ResourceRecord};

#[derive(Debug, Default, Deserialize)]
struct Inventory {
    #[serde(default)]
    resources: Vec<ResourceRecord>,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

/// Lookups against an inventory JSON file.
#[derive(Debug, Clone)]
pub struct InventoryDiscovery {
    path: PathBuf,
}

impl InventoryDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Inventory> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Could not read inventory {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid inventory JSON in {}", self.path.display()))
    }
}

fn same(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl Discovery for InventoryDiscovery {
    fn lookup(
        &self,
        resource_type: &str,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Option<ResourceRecord>> {
        let inventory = self.read()?;
        Ok(inventory.resources.into_iter().find(|r| {
            same(&r.resource_type, resource_type)
                && same(&r.name, name)
                && match (scope, r.scope.as_deref()) {
                    (Some(wanted), Some(actual)) => same(wanted, actual),
                    _ => true,
                }
        }))
    }

    fn relationships(&self) -> Result<Vec<Relationship>> {
        Ok(self.read()?.relationships)
    }
}

type CacheKey = (String, String, Option<String>);

/// TTL cache in front of another discovery source.
///
/// Only found resources are cached; a miss is always asked again. Validation
/// polling evicts a resource through [`Discovery::invalidate`] before each
/// retry, so a record that has not converged yet is never served twice.
pub struct CachedDiscovery<D> {
    inner: D,
    ttl: Duration,
    cache: Mutex<HashMap<CacheKey, (Instant, ResourceRecord)>>,
}

impl<D: Discovery> CachedDiscovery<D> {
    pub fn new(inner: D, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(resource_type: &str, name: &str, scope: Option<&str>) -> CacheKey {
        (
            resource_type.to_ascii_lowercase(),
            name.to_ascii_lowercase(),
            scope.map(str::to_ascii_lowercase),
        )
    }
}

impl<D: Discovery> Discovery for CachedDiscovery<D> {
    fn lookup(
        &self,
        resource_type: &str,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Option<ResourceRecord>> {
        let key = Self::key(resource_type, name, scope);
        {
            let cache = self
                .cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((at, record)) = cache.get(&key) {
                if at.elapsed() < self.ttl {
                    log::trace!("Discovery cache hit for {resource_type}/{name}");
                    return Ok(Some(record.clone()));
                }
            }
        }

        let found = self.inner.lookup(resource_type, name, scope)?;
        if let Some(record) = &found {
            self.cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(key, (Instant::now(), record.clone()));
        }
        Ok(found)
    }

    fn relationships(&self) -> Result<Vec<Relationship>> {
        self.inner.relationships()
    }

    fn invalidate(&self, resource_type: &str, name: &str, scope: Option<&str>) {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&Self::key(resource_type, name, scope));
        self.inner.invalidate(resource_type, name, scope);
    }
}
