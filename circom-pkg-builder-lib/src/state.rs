use crate::error::{Error, Result};
use crate::types::PackageInfo;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::fs;
use std::path::Path;

const DB_SUBDIR: &str = "package_db";
const PACKAGES_TREE_NAME: &[u8] = b"packages";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IndexEntry {
    /// Name handed out to a build that has not finished persisting yet.
    Reserved { request_id: String },
    Published(PackageInfo),
}

/// Durable record of every package name ever issued.
///
/// Names are reserved with a compare-and-swap before any object is written, so
/// two builds can never end up sharing one.
#[derive(Debug, Clone)] // Clone is cheap because Db is Arc-based
pub struct PackageIndex {
    db: Db,
    packages: sled::Tree,
}

impl PackageIndex {
    /// Creates or opens the index below `base_path`.
    pub fn open(base_path: &Path) -> Result<Self> {
        let db_path = base_path.join(DB_SUBDIR);
        fs::create_dir_all(&db_path)?;
        let db = sled::open(&db_path)?;
        let packages = db.open_tree(PACKAGES_TREE_NAME)?;
        Ok(Self { db, packages })
    }

    /// In-memory index for tests and throwaway runs.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let packages = db.open_tree(PACKAGES_TREE_NAME)?;
        Ok(Self { db, packages })
    }

    /// Claims `name`. Returns `false` if it was already taken.
    pub fn reserve(&self, name: &str, request_id: &str) -> Result<bool> {
        let entry = bincode::serialize(&IndexEntry::Reserved {
            request_id: request_id.to_string(),
        })?;
        let swapped = self
            .packages
            .compare_and_swap(name.as_bytes(), None as Option<&[u8]>, Some(entry))?;
        Ok(swapped.is_ok())
    }

    /// Marks a reserved name as a complete package.
    pub fn publish(&self, info: &PackageInfo) -> Result<()> {
        let bytes = bincode::serialize(&IndexEntry::Published(info.clone()))?;
        self.packages.insert(info.pkg_name.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Drops a reservation left by a failed build. Published entries are kept.
    pub fn release(&self, name: &str) -> Result<()> {
        if let Some(bytes) = self.packages.get(name.as_bytes())? {
            if let IndexEntry::Reserved { .. } = bincode::deserialize::<IndexEntry>(&bytes)? {
                self.packages
                    .compare_and_swap(name.as_bytes(), Some(bytes), None as Option<&[u8]>)?
                    .map_err(|_| {
                        Error::InvalidInput(format!("Package {} changed while releasing", name))
                    })?;
            }
        }
        Ok(())
    }

    /// Metadata of a published package.
    pub fn get(&self, name: &str) -> Result<Option<PackageInfo>> {
        match self.packages.get(name.as_bytes())? {
            Some(bytes) => match bincode::deserialize::<IndexEntry>(&bytes)? {
                IndexEntry::Published(info) => Ok(Some(info)),
                IndexEntry::Reserved { .. } => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub fn list_package_names(&self) -> impl Iterator<Item = Result<String>> + '_ {
        self.packages.iter().keys().map(|key_result| {
            let key_bytes = key_result?;
            String::from_utf8(key_bytes.to_vec())
                .map_err(|e| Error::InvalidInput(format!("Invalid UTF8 key in index: {}", e)))
        })
    }
}
