//! Catalog records and the store they are fetched from.
//!
//! The similarity core only needs bulk lookup by id. Index builds walk the
//! whole catalog, and the brand endpoints group records by vendor.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Opaque, externally assigned catalog identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogId(String);

impl CatalogId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CatalogId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CatalogId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: CatalogId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    pub image_url: String,
    #[serde(default)]
    pub product_url: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
}

/// One brand card: a vendor, how many items it has, and a representative image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorSummary {
    pub vendor: String,
    pub item_count: usize,
    pub brand_image: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("catalog fetch timed out after {0} ms")]
    Timeout(u128),

    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

pub trait CatalogStore: Send + Sync {
    /// Records for the given ids. Unknown ids are omitted, not an error.
    fn fetch_by_ids(&self, ids: &HashSet<CatalogId>) -> Result<Vec<CatalogRecord>, CatalogError>;

    /// Every record, in catalog order.
    fn all(&self) -> Result<Vec<CatalogRecord>, CatalogError>;

    /// Vendors with item counts, largest first.
    fn vendors(&self) -> Result<Vec<VendorSummary>, CatalogError>;

    /// Records of one vendor (case-insensitive), most recently added first.
    fn by_vendor(&self, vendor: &str) -> Result<Vec<CatalogRecord>, CatalogError>;

    /// Pick up external changes before an index build.
    fn refresh(&self) -> Result<(), CatalogError> {
        Ok(())
    }
}

/// Catalog read from a CSV file with a header row
/// (`id,title,price,image_url,product_url,vendor`).
pub struct CsvCatalog {
    path: PathBuf,
    records: RwLock<Vec<CatalogRecord>>,
}

impl CsvCatalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let records = Self::read_records(path)?;
        log::info!("loaded {} catalog records from {}", records.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            records: RwLock::new(records),
        })
    }

    /// In-memory catalog, used by tests and tools that already hold records.
    pub fn from_records(records: Vec<CatalogRecord>) -> Self {
        Self {
            path: PathBuf::new(),
            records: RwLock::new(dedup_by_id(records)),
        }
    }

    /// Re-read the backing file.
    pub fn reload(&self) -> Result<usize, CatalogError> {
        let records = Self::read_records(&self.path)?;
        let count = records.len();
        *self.write_records()? = records;
        Ok(count)
    }

    fn read_records(path: &Path) -> Result<Vec<CatalogRecord>, CatalogError> {
        let mut reader = csv::Reader::from_path(path)?;
        let records = reader
            .deserialize::<CatalogRecord>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dedup_by_id(records))
    }

    fn read_guard(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, Vec<CatalogRecord>>, CatalogError> {
        self.records
            .read()
            .map_err(|e| CatalogError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn write_records(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, Vec<CatalogRecord>>, CatalogError> {
        self.records
            .write()
            .map_err(|e| CatalogError::Unavailable(format!("lock poisoned: {e}")))
    }
}

impl CatalogStore for CsvCatalog {
    fn fetch_by_ids(&self, ids: &HashSet<CatalogId>) -> Result<Vec<CatalogRecord>, CatalogError> {
        Ok(self
            .read_guard()?
            .iter()
            .filter(|record| ids.contains(&record.id))
            .cloned()
            .collect())
    }

    fn all(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        Ok(self.read_guard()?.clone())
    }

    fn vendors(&self) -> Result<Vec<VendorSummary>, CatalogError> {
        let records = self.read_guard()?;

        let mut by_vendor: HashMap<&str, VendorSummary> = HashMap::new();
        for record in records.iter() {
            let Some(vendor) = record.vendor.as_deref().filter(|v| !v.is_empty()) else {
                continue;
            };
            by_vendor
                .entry(vendor)
                .and_modify(|summary| summary.item_count += 1)
                .or_insert_with(|| VendorSummary {
                    vendor: vendor.to_string(),
                    item_count: 1,
                    brand_image: record.image_url.clone(),
                });
        }

        let mut vendors: Vec<VendorSummary> = by_vendor.into_values().collect();
        vendors.sort_by(|a, b| {
            b.item_count
                .cmp(&a.item_count)
                .then_with(|| a.vendor.cmp(&b.vendor))
        });
        Ok(vendors)
    }

    fn by_vendor(&self, vendor: &str) -> Result<Vec<CatalogRecord>, CatalogError> {
        let wanted = vendor.to_lowercase();
        Ok(self
            .read_guard()?
            .iter()
            .rev()
            .filter(|record| {
                record
                    .vendor
                    .as_deref()
                    .is_some_and(|v| v.to_lowercase() == wanted)
            })
            .cloned()
            .collect())
    }

    fn refresh(&self) -> Result<(), CatalogError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let count = self.reload()?;
        log::info!("reloaded {} catalog records", count);
        Ok(())
    }
}

/// Keep the first record for every id.
fn dedup_by_id(records: Vec<CatalogRecord>) -> Vec<CatalogRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| {
            let fresh = seen.insert(record.id.clone());
            if !fresh {
                log::warn!("duplicate catalog id {}, keeping first occurrence", record.id);
            }
            fresh
        })
        .collect()
}
