// ============================================
// ImageSmith - session.rs
// ============================================
// Mount session lifecycle.
//
// A MountSession tracks one index of one container from mount to
// dismount. The state machine is:
//
//   Unmounted --mount()--> Mounting --ok--> Mounted
//   Mounting  --err--> Failed               (partial mount dir removed)
//   Mounted --dismount()--> Unmounting --ok--> Unmounted
//   Unmounting --err--> Failed
//   Unmounting --err, force, dir removed--> ForciblyUnmounted
//
// Failed, Unmounted, and ForciblyUnmounted are terminal. A Failed
// session's mount path must not be retried; allocate a fresh one.
// ============================================

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dism::ImageBackend;
use crate::error::{Result, ServicingError};
use crate::progress::ProgressSink;

/// Lifecycle state of a mount session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MountState {
    /// Not mounted. Terminal after a successful dismount.
    Unmounted,
    /// The OS mount call is in flight.
    Mounting,
    /// Live: the image contents are visible at the mount path.
    Mounted,
    /// The OS unmount call is in flight.
    Unmounting,
    /// Terminal failure. `error_message` carries the cause.
    Failed,
    /// Terminal: the OS unmount failed but the mount directory was
    /// force-removed. The commit was NOT verified; treat the source
    /// image contents as unchanged until proven otherwise.
    ForciblyUnmounted,
}

/// One live or terminated mount of a single image index.
#[derive(Debug)]
pub struct MountSession {
    /// Process-unique identifier, generated at mount time, never reused.
    pub mount_id: Uuid,

    /// Container file this session was opened from.
    pub source_image: PathBuf,

    /// 1-based index inside the container.
    pub image_index: u32,

    /// Shared by all sessions opened from the same container invocation.
    pub group_id: String,

    /// Directory the image is (or was) mounted at. Unique per
    /// `(group_id, image_index)` within a run.
    pub mount_path: PathBuf,

    /// Whether the image was mounted read-only. Fixed at mount time;
    /// a read-only session can never be committed with save.
    pub read_only: bool,

    /// Result object from the most recent processing stage, attached by
    /// external collaborators. The core only passes it through.
    pub last_stage_result: Option<serde_json::Value>,

    /// Failure cause. Set whenever the session leaves the happy path.
    pub error_message: Option<String>,

    state: MountState,

    /// Number of registry hives currently loaded from this mount.
    /// Dismount refuses while this is non-zero: a loaded hive keeps the
    /// OS from releasing the image files.
    open_hives: Arc<AtomicUsize>,
}

impl MountSession {
    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn is_mounted(&self) -> bool {
        self.state == MountState::Mounted
    }

    /// Number of hive handles still open against this mount.
    pub fn open_hive_count(&self) -> usize {
        self.open_hives.load(Ordering::SeqCst)
    }

    /// Counter shared with hive handles derived from this session.
    pub(crate) fn hive_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_hives)
    }
}

/// Dismount policy for one session.
#[derive(Debug, Clone, Copy)]
pub struct DismountOptions {
    /// Commit changes. Rejected on read-only sessions.
    pub save: bool,
    /// Append the commit instead of rewriting unrelated indices.
    /// Passed through to the OS call; only meaningful with `save`.
    pub append: bool,
    /// On unmount failure, force-remove the mount directory anyway and
    /// report `ForciblyUnmounted`.
    pub force: bool,
    /// Remove the mount directory after a successful dismount.
    pub remove_dir: bool,
}

impl DismountOptions {
    /// Discard changes, keep nothing.
    pub fn discard() -> Self {
        Self {
            save: false,
            append: false,
            force: false,
            remove_dir: true,
        }
    }

    /// Commit changes on dismount.
    pub fn save() -> Self {
        Self {
            save: true,
            append: false,
            force: false,
            remove_dir: true,
        }
    }

    pub fn from_config(config: &crate::config::ServicingConfig) -> Self {
        Self {
            save: config.save_changes && !config.read_only,
            append: config.append,
            force: config.force_unmount,
            remove_dir: config.remove_mount_dirs,
        }
    }
}

// ============================================
// SESSION MANAGER
// ============================================

/// Mounts and dismounts image indices, tracking every live session.
///
/// Mount and dismount of sessions sharing a source container are
/// serialized through a per-file lock: the OS image API serializes
/// access to a single container, so concurrent operations on different
/// indices of the same file are unsafe. Different source files do not
/// contend with each other.
pub struct SessionManager {
    backend: Arc<dyn ImageBackend>,
    progress: Arc<dyn ProgressSink>,
    source_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    active_paths: Mutex<HashSet<PathBuf>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn ImageBackend>, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            backend,
            progress,
            source_locks: Mutex::new(HashMap::new()),
            active_paths: Mutex::new(HashSet::new()),
        }
    }

    /// Mount paths of all currently `Mounted` sessions. Feeds the
    /// allocator's stale-pruning so live mounts are never touched.
    pub fn active_mount_paths(&self) -> HashSet<PathBuf> {
        self.lock_active().clone()
    }

    /// The progress sink this manager reports to.
    pub fn progress(&self) -> &dyn ProgressSink {
        self.progress.as_ref()
    }

    /// Run the OS orphaned-mount cleanup pass (crash recovery).
    pub fn cleanup_orphaned(&self) -> Result<()> {
        self.progress.report("Cleaning up orphaned mounts", 0);
        let result = self.backend.cleanup_orphaned();
        self.progress.report("Cleaning up orphaned mounts", 100);
        result
    }

    /// Mount one index of a container onto `mount_path`.
    ///
    /// Always returns a session record. On OS failure the partially
    /// created mount directory is deleted best-effort and the session
    /// comes back in `Failed` state with the captured error message;
    /// callers must treat that as terminal and not retry the same path.
    pub fn mount(
        &self,
        source: &Path,
        index: u32,
        group_id: &str,
        mount_path: &Path,
        read_only: bool,
    ) -> MountSession {
        let mut session = MountSession {
            mount_id: Uuid::new_v4(),
            source_image: source.to_path_buf(),
            image_index: index,
            group_id: group_id.to_string(),
            mount_path: mount_path.to_path_buf(),
            read_only,
            last_stage_result: None,
            error_message: None,
            state: MountState::Mounting,
            open_hives: Arc::new(AtomicUsize::new(0)),
        };

        let label = format!(
            "Mounting index {} of {}{}",
            index,
            source.display(),
            if read_only { " (read-only)" } else { "" }
        );
        self.progress.report(&label, 0);

        let lock = self.source_lock(source);
        let guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let outcome = self
            .backend
            .mount_image(source, mount_path, index, read_only);
        drop(guard);

        match outcome {
            Ok(()) => {
                session.state = MountState::Mounted;
                self.lock_active().insert(mount_path.to_path_buf());
                self.progress.report(&label, 100);
                debug!(mount_id = %session.mount_id, path = %mount_path.display(),
                    "image mounted");
            }
            Err(e) => {
                session.state = MountState::Failed;
                session.error_message = Some(e.to_string());
                // The OS may have left a half-populated directory behind
                if let Err(cleanup) = fs::remove_dir_all(mount_path) {
                    warn!(path = %mount_path.display(), error = %cleanup,
                        "could not remove partial mount directory");
                }
                warn!(mount_id = %session.mount_id, error = %e, "mount failed");
            }
        }

        session
    }

    /// Dismount a session, committing or discarding its changes.
    ///
    /// # Arguments
    /// * `session` - Must be `Mounted`. Calling on an already-terminated
    ///   session is an idempotent no-op, so cleanup paths can call this
    ///   unconditionally.
    /// * `opts` - Save/append/force/remove-dir policy.
    ///
    /// # Returns
    /// The resulting state. `ForciblyUnmounted` means the OS unmount
    /// failed but the directory was force-removed; the commit was not
    /// verified and `error_message` carries the original failure.
    pub fn dismount(
        &self,
        session: &mut MountSession,
        opts: &DismountOptions,
    ) -> Result<MountState> {
        if session.state != MountState::Mounted {
            debug!(mount_id = %session.mount_id, state = ?session.state,
                "dismount called on a non-mounted session; nothing to do");
            return Ok(session.state);
        }

        if opts.save && session.read_only {
            // Enforced here: some OS primitives silently ignore save on
            // read-only mounts, and a silent no-op would hide the bug.
            return Err(ServicingError::InvalidOperation(format!(
                "cannot commit read-only mount of {} index {}",
                session.source_image.display(),
                session.image_index
            )));
        }

        let open_hives = session.open_hive_count();
        if open_hives > 0 {
            return Err(ServicingError::InvalidOperation(format!(
                "{} registry hive handle(s) still open against {}; \
                 unload them before dismounting",
                open_hives,
                session.mount_path.display()
            )));
        }

        let label = format!(
            "Dismounting {} ({})",
            session.mount_path.display(),
            if opts.save { "commit" } else { "discard" }
        );
        self.progress.report(&label, 0);
        session.state = MountState::Unmounting;

        let lock = self.source_lock(&session.source_image);
        let guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let outcome = self
            .backend
            .unmount_image(&session.mount_path, opts.save, opts.append);
        drop(guard);

        match outcome {
            Ok(()) => {
                session.state = MountState::Unmounted;
                self.lock_active().remove(&session.mount_path);
                if opts.remove_dir {
                    if let Err(e) = fs::remove_dir_all(&session.mount_path) {
                        warn!(path = %session.mount_path.display(), error = %e,
                            "could not remove mount directory after dismount");
                    }
                }
                self.progress.report(&label, 100);
                debug!(mount_id = %session.mount_id, "image dismounted");
                Ok(MountState::Unmounted)
            }
            Err(e) => {
                session.error_message = Some(e.to_string());
                session.state = MountState::Failed;

                if opts.force {
                    // Best-effort forced cleanup. The filesystem artifact
                    // goes away even though the commit was not verified.
                    match fs::remove_dir_all(&session.mount_path) {
                        Ok(()) => {
                            session.state = MountState::ForciblyUnmounted;
                            self.lock_active().remove(&session.mount_path);
                            self.progress.report(
                                &format!(
                                    "Forced cleanup of {} (commit NOT verified)",
                                    session.mount_path.display()
                                ),
                                100,
                            );
                            warn!(mount_id = %session.mount_id,
                                "dismount failed; mount directory force-removed, \
                                 commit not verified");
                            return Ok(MountState::ForciblyUnmounted);
                        }
                        Err(cleanup) => {
                            warn!(path = %session.mount_path.display(), error = %cleanup,
                                "forced cleanup could not remove mount directory");
                        }
                    }
                }

                Err(e)
            }
        }
    }

    /// Per-source-file lock, created on first use.
    fn source_lock(&self, source: &Path) -> Arc<Mutex<()>> {
        let key = normalize_source_path(source);
        let mut locks = match self.source_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key).or_default())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        match self.active_paths.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Normalize a source path so the same container always maps to the
/// same lock, however it was spelled on the command line.
fn normalize_source_path(source: &Path) -> PathBuf {
    fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf())
}

// ============================================
// TESTS
// ============================================
