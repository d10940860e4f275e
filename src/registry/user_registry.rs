use crate::error_handling::types::RegistryError;
use crate::registry::file_lock::{LockMode, RegistryLock};
use crate::registry::types::{IdentityLookup, RegistryDocument, UserRecord};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Persistent mapping from real client address to registered user.
///
/// The in-memory view is only a cache. Every mutation takes the exclusive
/// registry lock, re-reads the file and writes the result back atomically,
/// so concurrent administrative invocations never lose each other's changes.
#[derive(Debug)]
pub struct UserRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    records: HashMap<IpAddr, UserRecord>,
}

impl UserRegistry {
    /// Opens the registry at `path`. A missing file is an empty registry.
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self, RegistryError> {
        let mut registry = Self {
            path: path.to_path_buf(),
            lock_path: lock_path_for(path),
            lock_timeout,
            records: HashMap::new(),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Refreshes the cached view from disk under a shared lock.
    pub fn reload(&mut self) -> Result<(), RegistryError> {
        let _lock = RegistryLock::acquire(&self.lock_path, LockMode::Shared, self.lock_timeout)?;
        self.records = read_records(&self.path)?;
        debug!(
            "Loaded {} registered users from {}",
            self.records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Like [`reload`](Self::reload) but never waits for the lock.
    ///
    /// Returns `Ok(false)` and keeps the cached view when a writer holds the
    /// lock.
    pub fn refresh(&mut self) -> Result<bool, RegistryError> {
        let Some(_lock) = RegistryLock::try_acquire(&self.lock_path, LockMode::Shared)? else {
            debug!("User registry is being written, keeping cached users");
            return Ok(false);
        };
        self.records = read_records(&self.path)?;
        Ok(true)
    }

    /// Registers a new user. Fails if the real address is already taken.
    pub fn add(
        &mut self,
        real_address: IpAddr,
        virtual_address: IpAddr,
        common_name: &str,
    ) -> Result<UserRecord, RegistryError> {
        let common_name = common_name.trim();
        if common_name.is_empty() {
            return Err(RegistryError::InvalidRecord(
                "common name must not be empty".to_string(),
            ));
        }

        let _lock = RegistryLock::acquire(&self.lock_path, LockMode::Exclusive, self.lock_timeout)?;
        let mut records = read_records(&self.path)?;
        if records.contains_key(&real_address) {
            self.records = records;
            return Err(RegistryError::DuplicateKey(real_address));
        }
        if let Some(other) = records.values().find(|r| r.virtual_address == virtual_address) {
            warn!(
                "Virtual address {} is already assigned to {} ({})",
                virtual_address, other.common_name, other.real_address
            );
        }

        let record = UserRecord::new(real_address, virtual_address, common_name);
        records.insert(real_address, record.clone());
        write_records(&self.path, &records)?;
        self.records = records;

        info!(
            "Added user {} ({}) with virtual address {}",
            record.common_name, record.real_address, record.virtual_address
        );
        Ok(record)
    }

    /// Removes the user registered for `real_address`.
    pub fn delete(&mut self, real_address: IpAddr) -> Result<UserRecord, RegistryError> {
        let _lock = RegistryLock::acquire(&self.lock_path, LockMode::Exclusive, self.lock_timeout)?;
        let mut records = read_records(&self.path)?;
        let removed = match records.remove(&real_address) {
            Some(r) => r,
            None => {
                self.records = records;
                return Err(RegistryError::NotFound(real_address));
            }
        };
        write_records(&self.path, &records)?;
        self.records = records;

        info!(
            "Deleted user {} ({})",
            removed.common_name, removed.real_address
        );
        Ok(removed)
    }

    /// Records sorted by real address.
    pub fn records(&self) -> Vec<&UserRecord> {
        let mut all: Vec<&UserRecord> = self.records.values().collect();
        all.sort_by_key(|r| r.real_address);
        all
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Describes entries that are legal but probably a mistake.
    pub fn consistency_report(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut seen: HashMap<IpAddr, IpAddr> = HashMap::new();
        for record in self.records() {
            if let Some(first) = seen.insert(record.virtual_address, record.real_address) {
                issues.push(format!(
                    "virtual address {} shared by {} and {}",
                    record.virtual_address, first, record.real_address
                ));
            }
            if record.common_name.trim().is_empty() {
                issues.push(format!("user {} has an empty common name", record.real_address));
            }
        }
        issues
    }
}

impl IdentityLookup for UserRegistry {
    fn lookup(&self, real_address: &IpAddr) -> Option<&UserRecord> {
        self.records.get(real_address)
    }
}

pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "users.json".into());
    name.push(".lock");
    path.with_file_name(name)
}

fn read_records(path: &Path) -> Result<HashMap<IpAddr, UserRecord>, RegistryError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let document: RegistryDocument = serde_json::from_str(&content)
        .map_err(|e| RegistryError::Corrupt(format!("{}: {}", path.display(), e)))?;

    let mut records = HashMap::new();
    let mut seen = HashSet::new();
    for record in document.into_records() {
        if !seen.insert(record.real_address) {
            return Err(RegistryError::Corrupt(format!(
                "{}: real address {} appears more than once",
                path.display(),
                record.real_address
            )));
        }
        records.insert(record.real_address, record);
    }
    Ok(records)
}

fn write_records(path: &Path, records: &HashMap<IpAddr, UserRecord>) -> Result<(), RegistryError> {
    let mut sorted: Vec<&UserRecord> = records.values().collect();
    sorted.sort_by_key(|r| r.real_address);
    let json = serde_json::to_string_pretty(&sorted)
        .map_err(|e| RegistryError::WriteFailed(e.to_string()))?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| RegistryError::WriteFailed(format!("{}: {}", path.display(), e.error)))?;
    Ok(())
}
