use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::warn;

/// Service name -> PID of the process this manager launched. `None` marks a
/// service started through an external supervisor.
pub type RegistryEntries = BTreeMap<String, Option<u32>>;

/// JSON file (`service_pids.json`) remembering which PIDs this manager
/// started. Every mutation is a locked read-modify-write with an atomic
/// replace, so concurrent lifecycle operations on different services never
/// lose each other's entries.
#[derive(Debug)]
pub struct ProcessRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProcessRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Result<RegistryEntries> {
        let _guard = self.guard();
        load_entries(&self.path)
    }

    /// Recorded entry for `name`. The outer `None` means no entry exists.
    pub fn get(&self, name: &str) -> Result<Option<Option<u32>>> {
        Ok(self.entries()?.get(name).copied())
    }

    pub fn record(&self, name: &str, pid: Option<u32>) -> Result<()> {
        self.update(|entries| {
            entries.insert(name.to_string(), pid);
        })
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut removed = false;
        self.update(|entries| {
            removed = entries.remove(name).is_some();
        })?;
        Ok(removed)
    }

    fn update(&self, mutate: impl FnOnce(&mut RegistryEntries)) -> Result<()> {
        let _guard = self.guard();
        let mut entries = load_entries(&self.path)?;
        mutate(&mut entries);
        save_entries(&self.path, &entries)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is the file itself; a poisoned lock leaves it intact.
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_entries(path: &Path) -> Result<RegistryEntries> {
    if !path.exists() {
        return Ok(RegistryEntries::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read registry {}", path.display()))?;

    if content.trim().is_empty() {
        return Ok(RegistryEntries::new());
    }

    match serde_json::from_str::<RegistryEntries>(&content) {
        Ok(entries) => Ok(entries),
        Err(error) => {
            let backup = corrupted_backup_path(path);
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(
                    "failed to move corrupted registry {} -> {}: {rename_err}",
                    path.display(),
                    backup.display()
                );
            } else {
                warn!(
                    "registry {} is corrupted ({error}), moved to {}",
                    path.display(),
                    backup.display()
                );
            }
            Ok(RegistryEntries::new())
        }
    }
}

fn save_entries(path: &Path, entries: &RegistryEntries) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload = serde_json::to_vec_pretty(entries)?;
    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write temporary registry {}", tmp_path.display()))?;
    replace_file(&tmp_path, path)
}

fn corrupted_backup_path(path: &Path) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    path.with_extension(format!("corrupt-{suffix}.json"))
}

fn replace_file(tmp_path: &Path, path: &Path) -> Result<()> {
    match fs::rename(tmp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            #[cfg(windows)]
            {
                if path.exists() {
                    fs::remove_file(path).with_context(|| {
                        format!("failed to remove registry {}", path.display())
                    })?;
                    fs::rename(tmp_path, path).with_context(|| {
                        format!("failed to replace registry {}", path.display())
                    })?;
                    return Ok(());
                }
            }

            Err(rename_err).with_context(|| format!("failed to replace registry {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::ProcessRegistry;

    #[test]
    fn records_and_removes_entries() {
        let dir = temp_dir("record");
        let registry = ProcessRegistry::new(dir.join("service_pids.json"));

        assert_eq!(registry.get("crawler").expect("get failed"), None);

        registry.record("crawler", Some(4242)).expect("record failed");
        registry.record("gateway", None).expect("record failed");
        assert_eq!(registry.get("crawler").expect("get failed"), Some(Some(4242)));
        assert_eq!(registry.get("gateway").expect("get failed"), Some(None));

        assert!(registry.remove("crawler").expect("remove failed"));
        assert!(!registry.remove("crawler").expect("remove failed"));
        assert_eq!(registry.get("crawler").expect("get failed"), None);

        let on_disk = fs::read_to_string(registry.path()).expect("registry should exist");
        assert!(on_disk.contains("\"gateway\": null"), "{on_disk}");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_registry_is_quarantined_and_treated_as_empty() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        let path = dir.join("service_pids.json");
        fs::write(&path, "{ not valid json ]").expect("failed to write corrupt registry");

        let registry = ProcessRegistry::new(path.clone());
        assert!(registry.entries().expect("load should recover").is_empty());
        assert!(!path.exists(), "corrupted file should have been renamed");

        let backup_found = fs::read_dir(&dir)
            .expect("failed to read temp dir")
            .flatten()
            .any(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| name.contains(".corrupt-"))
                    .unwrap_or(false)
            });
        assert!(backup_found, "expected quarantined registry copy");

        registry.record("admin", Some(1)).expect("record after recovery failed");
        assert_eq!(registry.get("admin").expect("get failed"), Some(Some(1)));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let dir = temp_dir("concurrent");
        let registry = Arc::new(ProcessRegistry::new(dir.join("service_pids.json")));

        let handles: Vec<_> = (0..8_u32)
            .map(|idx| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .record(&format!("svc-{idx}"), Some(1000 + idx))
                        .expect("record failed");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }

        let entries = registry.entries().expect("load failed");
        assert_eq!(entries.len(), 8);
        assert_eq!(entries.get("svc-3"), Some(&Some(1003)));

        let _ = fs::remove_dir_all(dir);
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("svcmgr-registry-{prefix}-{nonce}"))
    }
}
