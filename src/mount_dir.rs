// ============================================
// ImageSmith - mount_dir.rs
// ============================================
// Mount directory allocation.
//
// Every mount gets its own directory under the configured root, named
// root/{group_id}/{index}. The group id is shared by all mounts opened
// from the same container invocation, so sibling indices land next to
// each other and never collide with a concurrent run's directories.
//
// A path handed out once is never handed out again within the same
// process run, even after its session dismounts: the OS completes
// unmounts lazily and reusing the path too early races with that.
// ============================================

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::ServicingConfig;
use crate::error::{Result, ServicingError};

/// Allocates collision-free mount directories under a configured root.
pub struct MountDirAllocator {
    root: PathBuf,
    /// Every path ever handed out by this allocator. Never shrinks.
    handed_out: Mutex<HashSet<PathBuf>>,
}

impl MountDirAllocator {
    pub fn new(config: &ServicingConfig) -> Self {
        Self {
            root: config.mount_root.clone(),
            handed_out: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate a group id for one container-file invocation.
    pub fn new_group_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Verify the mount root exists (or can be created) and is writable.
    ///
    /// Failing this is a configuration error, fatal for the whole run;
    /// nothing later can succeed without a usable root.
    pub fn validate_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            ServicingError::directory_unavailable(&self.root, format!("cannot create: {}", e))
        })?;

        // Writability probe: create and delete a throwaway file
        let probe = self
            .root
            .join(format!(".imagesmith_probe_{}", Uuid::new_v4().simple()));
        fs::write(&probe, b"probe").map_err(|e| {
            ServicingError::directory_unavailable(&self.root, format!("not writable: {}", e))
        })?;
        let _ = fs::remove_file(&probe);

        Ok(())
    }

    /// Reserve and create the mount directory for `(group_id, index)`.
    ///
    /// Fails with `DirectoryUnavailable` if the path was already handed
    /// out this run, or if it exists on disk with content (a live mount
    /// or a leftover from a crashed run that pruning has not removed).
    pub fn allocate(&self, group_id: &str, index: u32) -> Result<PathBuf> {
        let path = self.root.join(group_id).join(index.to_string());

        let mut handed_out = match self.handed_out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handed_out.contains(&path) {
            return Err(ServicingError::directory_unavailable(
                &path,
                "already allocated in this run; mount paths are never reused",
            ));
        }

        if path.exists() && !is_empty_dir(&path) {
            return Err(ServicingError::directory_unavailable(
                &path,
                "directory exists and is not empty \
                 (stale mount from a previous run? try the cleanup pass)",
            ));
        }

        fs::create_dir_all(&path).map_err(|e| {
            ServicingError::directory_unavailable(&path, format!("cannot create: {}", e))
        })?;

        handed_out.insert(path.clone());
        debug!(path = %path.display(), "allocated mount directory");
        Ok(path)
    }

    /// Best-effort removal of stale mount directories under the root.
    ///
    /// Scans `root/{group}/{index}` directories and deletes any that no
    /// live session owns. Failures only cost disk hygiene, so they are
    /// logged as warnings and never fail the run. Paths in `live_paths`
    /// are never touched; once a session has mounted onto a path, only
    /// that session may delete it.
    pub fn prune_stale(&self, live_paths: &HashSet<PathBuf>) {
        if !self.root.exists() {
            return;
        }

        let mut pruned = 0usize;
        for entry in WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if live_paths.contains(path) {
                continue;
            }
            match fs::remove_dir_all(path) {
                Ok(()) => {
                    pruned += 1;
                    debug!(path = %path.display(), "pruned stale mount directory");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e,
                        "could not prune stale mount directory");
                }
            }
        }

        // Drop group directories that are now empty
        if let Ok(groups) = fs::read_dir(&self.root) {
            for group in groups.filter_map(|e| e.ok()) {
                let path = group.path();
                if path.is_dir() && is_empty_dir(&path) {
                    let _ = fs::remove_dir(&path);
                }
            }
        }

        if pruned > 0 {
            debug!(pruned, "stale mount directory pruning finished");
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .next()
        .is_none()
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServicingConfig {
        ServicingConfig {
            mount_root: std::env::temp_dir()
                .join(format!("imagesmith_test_{}", Uuid::new_v4().simple())),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_creates_root() {
        let config = test_config();
        let allocator = MountDirAllocator::new(&config);
        allocator.validate_root().unwrap();
        assert!(config.mount_root.is_dir());
        let _ = fs::remove_dir_all(&config.mount_root);
    }

    #[test]
    fn test_allocate_unique_paths() {
        let config = test_config();
        let allocator = MountDirAllocator::new(&config);
        allocator.validate_root().unwrap();

        let group = MountDirAllocator::new_group_id();
        let a = allocator.allocate(&group, 1).unwrap();
        let b = allocator.allocate(&group, 2).unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir());
        assert!(b.is_dir());

        let _ = fs::remove_dir_all(&config.mount_root);
    }

    #[test]
    fn test_allocate_never_reuses_a_path() {
        let config = test_config();
        let allocator = MountDirAllocator::new(&config);
        allocator.validate_root().unwrap();

        let group = MountDirAllocator::new_group_id();
        allocator.allocate(&group, 1).unwrap();
        // Same (group, index) again, even though the directory is empty
        let err = allocator.allocate(&group, 1).unwrap_err();
        assert!(matches!(err, ServicingError::DirectoryUnavailable { .. }));

        let _ = fs::remove_dir_all(&config.mount_root);
    }

    #[test]
    fn test_allocate_rejects_foreign_non_empty_dir() {
        let config = test_config();
        let allocator = MountDirAllocator::new(&config);
        allocator.validate_root().unwrap();

        // Simulate a leftover from a crashed run
        let leftover = config.mount_root.join("deadbeef").join("1");
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join("file.txt"), b"junk").unwrap();

        let err = allocator.allocate("deadbeef", 1).unwrap_err();
        assert!(matches!(err, ServicingError::DirectoryUnavailable { .. }));

        let _ = fs::remove_dir_all(&config.mount_root);
    }

    #[test]
    fn test_prune_removes_stale_keeps_live() {
        let config = test_config();
        let allocator = MountDirAllocator::new(&config);
        allocator.validate_root().unwrap();

        let stale = config.mount_root.join("oldrun").join("1");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("leftover.txt"), b"junk").unwrap();

        let live = config.mount_root.join("thisrun").join("2");
        fs::create_dir_all(&live).unwrap();

        let mut live_paths = HashSet::new();
        live_paths.insert(live.clone());

        allocator.prune_stale(&live_paths);

        assert!(!stale.exists());
        assert!(!stale.parent().unwrap().exists()); // empty group dir removed too
        assert!(live.exists());

        let _ = fs::remove_dir_all(&config.mount_root);
    }
}
