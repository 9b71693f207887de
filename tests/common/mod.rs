// ============================================
// ImageSmith - tests/common/mod.rs
// ============================================
// Fake OS backends for the integration suites.
//
// The real backends shell out to DISM and reg.exe; these fakes model
// just enough of their observable behavior to exercise the lifecycle
// logic: a mount materializes a Windows\System32\config skeleton in
// the mount directory, a commit changes the container file's bytes,
// and fault-injection flags make specific calls fail on demand.
// ============================================

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use imagesmith::error::{Result, ServicingError};
use imagesmith::image::ImageIndexInfo;
use imagesmith::registry::{RegValue, RegistryBackend};
use imagesmith::ImageBackend;
use uuid::Uuid;

/// Fresh scratch directory for one test.
pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "imagesmith_it_{}_{}",
        label,
        Uuid::new_v4().simple()
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Create a fake .wim container file with known byte content.
pub fn make_container(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"WIMHDR fake container v1\n").unwrap();
    path
}

// ============================================
// FAKE IMAGE BACKEND
// ============================================

pub struct FakeImageBackend {
    /// Number of indices every container reports.
    pub index_count: u32,
    /// Mount calls for these indices fail.
    pub fail_mount_indices: Mutex<HashSet<u32>>,
    /// Unmount calls for these mount dirs fail.
    pub fail_unmount_dirs: Mutex<HashSet<PathBuf>>,
    /// mount_dir -> (container, index, read_only) for live fake mounts.
    pub mounted: Mutex<HashMap<PathBuf, (PathBuf, u32, bool)>>,
    /// Every unmount observed, as (mount_dir, commit, append).
    pub unmounts: Mutex<Vec<(PathBuf, bool, bool)>>,
    pub cleanup_calls: Mutex<usize>,
}

impl FakeImageBackend {
    pub fn new(index_count: u32) -> Self {
        Self {
            index_count,
            fail_mount_indices: Mutex::new(HashSet::new()),
            fail_unmount_dirs: Mutex::new(HashSet::new()),
            mounted: Mutex::new(HashMap::new()),
            unmounts: Mutex::new(Vec::new()),
            cleanup_calls: Mutex::new(0),
        }
    }

    pub fn fail_mount_of(&self, index: u32) {
        self.fail_mount_indices.lock().unwrap().insert(index);
    }

    pub fn fail_unmount_of(&self, mount_dir: &Path) {
        self.fail_unmount_dirs
            .lock()
            .unwrap()
            .insert(mount_dir.to_path_buf());
    }

    pub fn commits_of(&self, mount_dir: &Path) -> Vec<(bool, bool)> {
        self.unmounts
            .lock()
            .unwrap()
            .iter()
            .filter(|(dir, _, _)| dir == mount_dir)
            .map(|(_, commit, append)| (*commit, *append))
            .collect()
    }
}

impl ImageBackend for FakeImageBackend {
    fn mount_image(
        &self,
        container: &Path,
        mount_dir: &Path,
        index: u32,
        read_only: bool,
    ) -> Result<()> {
        if self.fail_mount_indices.lock().unwrap().contains(&index) {
            return Err(ServicingError::mount_failed(
                mount_dir,
                format!("injected mount failure for index {}", index),
            ));
        }

        let mut mounted = self.mounted.lock().unwrap();
        if mounted.contains_key(mount_dir) {
            return Err(ServicingError::mount_failed(
                mount_dir,
                "directory is already a mount point",
            ));
        }

        // Materialize the hive files a real mount would expose
        let config_dir = mount_dir.join("Windows").join("System32").join("config");
        fs::create_dir_all(&config_dir)?;
        for hive in ["SOFTWARE", "SYSTEM", "default"] {
            fs::write(
                config_dir.join(hive),
                format!("HIVE {} of index {}\n", hive, index),
            )?;
        }

        mounted.insert(
            mount_dir.to_path_buf(),
            (container.to_path_buf(), index, read_only),
        );
        Ok(())
    }

    fn unmount_image(&self, mount_dir: &Path, commit: bool, append: bool) -> Result<()> {
        self.unmounts
            .lock()
            .unwrap()
            .push((mount_dir.to_path_buf(), commit, append));

        if self.fail_unmount_dirs.lock().unwrap().contains(mount_dir) {
            return Err(ServicingError::dismount_failed(
                mount_dir,
                "injected unmount failure",
            ));
        }

        let (container, index, _read_only) = self
            .mounted
            .lock()
            .unwrap()
            .remove(mount_dir)
            .ok_or_else(|| ServicingError::dismount_failed(mount_dir, "nothing mounted here"))?;

        if commit {
            // A commit rewrites the container; model that as a byte change
            let mut bytes = fs::read(&container)?;
            bytes.extend_from_slice(format!("COMMIT index {}\n", index).as_bytes());
            fs::write(&container, bytes)?;
        }
        Ok(())
    }

    fn container_indices(&self, container: &Path) -> Result<Vec<ImageIndexInfo>> {
        if !container.is_file() {
            return Err(ServicingError::container_unreadable(
                container,
                "file not found",
            ));
        }
        Ok((1..=self.index_count)
            .map(|index| ImageIndexInfo {
                source_path: container.to_path_buf(),
                index,
                name: format!("Fake Windows {}", index),
                edition: "Professional".to_string(),
                architecture: "x64".to_string(),
                size_bytes: 4_000_000_000 + u64::from(index),
            })
            .collect())
    }

    fn cleanup_orphaned(&self) -> Result<()> {
        *self.cleanup_calls.lock().unwrap() += 1;
        Ok(())
    }
}

// ============================================
// FAKE REGISTRY BACKEND
// ============================================

pub struct FakeRegistryBackend {
    /// key_path (relative to HKLM) -> value name -> value.
    pub keys: Mutex<HashMap<String, HashMap<String, RegValue>>>,
    /// temp_key -> hive file currently loaded there.
    pub loaded: Mutex<HashMap<String, PathBuf>>,
    /// Next load_hive call returns this status.
    pub load_status: Mutex<i32>,
    /// When set, unload_hive returns a non-zero status.
    pub fail_unload: AtomicBool,
}

impl FakeRegistryBackend {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
            load_status: Mutex::new(0),
            fail_unload: AtomicBool::new(false),
        }
    }

    /// Snapshot of all key paths, for before/after namespace checks.
    pub fn key_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.keys.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().unwrap().len()
    }
}

impl RegistryBackend for FakeRegistryBackend {
    fn load_hive(&self, temp_key: &str, hive_file: &Path) -> Result<i32> {
        let status = *self.load_status.lock().unwrap();
        if status != 0 {
            return Ok(status);
        }

        self.loaded
            .lock()
            .unwrap()
            .insert(temp_key.to_string(), hive_file.to_path_buf());

        // Seed the keys every Windows hive carries
        let mut keys = self.keys.lock().unwrap();
        let version_key = format!("{}\\Microsoft\\Windows NT\\CurrentVersion", temp_key);
        let mut values = HashMap::new();
        values.insert(
            "ProductName".to_string(),
            RegValue::Sz("Fake Windows 11 Pro".to_string()),
        );
        values.insert(
            "CurrentBuild".to_string(),
            RegValue::Sz("22621".to_string()),
        );
        values.insert("InstallDate".to_string(), RegValue::Dword(0x63f4a2b1));
        keys.insert(version_key.clone(), values);
        keys.insert(format!("{}\\Fonts", version_key), HashMap::new());
        Ok(0)
    }

    fn unload_hive(&self, temp_key: &str) -> Result<i32> {
        if self.fail_unload.load(Ordering::SeqCst) {
            return Ok(1);
        }
        if self.loaded.lock().unwrap().remove(temp_key).is_none() {
            return Ok(1);
        }
        // Drop everything under the temp key
        let prefix = format!("{}\\", temp_key);
        self.keys
            .lock()
            .unwrap()
            .retain(|path, _| path != temp_key && !path.starts_with(&prefix));
        Ok(0)
    }

    fn set_value(&self, key_path: &str, name: &str, value: &RegValue) -> Result<()> {
        self.keys
            .lock()
            .unwrap()
            .entry(key_path.to_string())
            .or_default()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    fn query_value(&self, key_path: &str, name: &str) -> Result<Option<RegValue>> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .get(key_path)
            .and_then(|values| values.get(name))
            .cloned())
    }

    fn enumerate_subkeys(&self, key_path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}\\", key_path);
        let mut subkeys: Vec<String> = self
            .keys
            .lock()
            .unwrap()
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('\\'))
            .map(|rest| rest.to_string())
            .collect();
        subkeys.sort();
        subkeys.dedup();
        Ok(subkeys)
    }

    fn enumerate_values(&self, key_path: &str) -> Result<Vec<(String, RegValue)>> {
        let mut values: Vec<(String, RegValue)> = self
            .keys
            .lock()
            .unwrap()
            .get(key_path)
            .map(|values| {
                values
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(values)
    }

    fn delete_value(&self, key_path: &str, name: &str) -> Result<()> {
        if let Some(values) = self.keys.lock().unwrap().get_mut(key_path) {
            values.remove(name);
        }
        Ok(())
    }
}
