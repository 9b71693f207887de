// ============================================
// ImageSmith - config.rs
// ============================================
// Servicing configuration.
//
// Everything that used to be ambient state (mount root, commit policy)
// lives in an explicit struct that is passed into the allocator and
// orchestrator constructors. The struct can be loaded from a TOML file
// (imagesmith.toml) or built in code; CLI flags override fields after
// loading.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServicingError};

/// Helper function for serde default
fn default_true() -> bool {
    true
}

fn default_mount_root() -> PathBuf {
    std::env::temp_dir().join("ImageSmith_Mounts")
}

/// Configuration for a servicing run.
///
/// Defaults match the common case: read-write mounts committed on
/// dismount, mount directories removed afterwards, and the batch
/// continuing past individual failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicingConfig {
    /// Root directory under which per-image mount directories are created.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    /// Mount images read-only. A read-only mount can never be committed.
    #[serde(default)]
    pub read_only: bool,

    /// Commit changes on dismount. When false, changes are discarded.
    #[serde(default = "default_true")]
    pub save_changes: bool,

    /// Append the commit instead of rewriting unrelated indices.
    /// Only meaningful together with `save_changes`.
    #[serde(default)]
    pub append: bool,

    /// On a failed dismount, force-delete the mount directory anyway.
    /// The result is reported as a forced cleanup, never as a verified commit.
    #[serde(default)]
    pub force_unmount: bool,

    /// Remove mount directories after a successful dismount.
    #[serde(default = "default_true")]
    pub remove_mount_dirs: bool,

    /// Keep processing remaining batch items after one fails.
    #[serde(default = "default_true")]
    pub continue_on_error: bool,

    /// Prune stale mount directories and run the orphaned-mount cleanup
    /// pass before the first mount of a batch.
    #[serde(default = "default_true")]
    pub cleanup_at_start: bool,
}

impl Default for ServicingConfig {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            read_only: false,
            save_changes: true,
            append: false,
            force_unmount: false,
            remove_mount_dirs: true,
            continue_on_error: true,
            cleanup_at_start: true,
        }
    }
}

impl ServicingConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields fall back to their defaults, so a config file only
    /// needs to name the fields it changes.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ServicingError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&text).map_err(|e| {
            ServicingError::Config(format!("Cannot parse {}: {}", path.display(), e))
        })
    }

    /// Validate the configuration before a run.
    ///
    /// Checks internal consistency and, on Windows, that the process is
    /// elevated. DISM and `reg load` both require administrator rights;
    /// failing here gives an actionable message instead of an opaque
    /// DISM error halfway through a batch.
    pub fn validate(&self) -> Result<()> {
        if self.read_only && self.save_changes {
            return Err(ServicingError::Config(
                "read_only and save_changes are mutually exclusive: \
                 a read-only mount cannot commit changes"
                    .to_string(),
            ));
        }

        if self.append && !self.save_changes {
            return Err(ServicingError::Config(
                "append requires save_changes: there is no commit to append".to_string(),
            ));
        }

        if !is_elevated() {
            return Err(ServicingError::Config(
                "This process is not elevated.\n\
                 What to do:\n\
                 1. Run ImageSmith from an elevated (Administrator) prompt\n\
                 2. DISM mount and 'reg load' both refuse to run otherwise"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================
// ELEVATION CHECK
// ============================================

/// Check whether the current process runs with administrator rights.
#[cfg(windows)]
pub fn is_elevated() -> bool {
    use std::mem;
    use winapi::shared::minwindef::{DWORD, FALSE};
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

    unsafe {
        let mut token: HANDLE = std::ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == FALSE {
            return false;
        }

        let mut elevation: TOKEN_ELEVATION = mem::zeroed();
        let mut size: DWORD = mem::size_of::<TOKEN_ELEVATION>() as DWORD;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            size,
            &mut size,
        );
        CloseHandle(token);

        ok != FALSE && elevation.TokenIsElevated != 0
    }
}

/// Elevation is a Windows concept; other platforms only ever run the
/// test suite, so the check passes there.
#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    true
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServicingConfig::default();
        assert!(config.save_changes);
        assert!(config.remove_mount_dirs);
        assert!(config.continue_on_error);
        assert!(!config.read_only);
        assert!(!config.append);
        assert!(!config.force_unmount);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ServicingConfig = toml::from_str(
            r#"
            mount_root = "C:/Mounts"
            read_only = true
            save_changes = false
            "#,
        )
        .unwrap();

        assert_eq!(config.mount_root, PathBuf::from("C:/Mounts"));
        assert!(config.read_only);
        assert!(!config.save_changes);
        // Unnamed fields keep their defaults
        assert!(config.continue_on_error);
        assert!(config.remove_mount_dirs);
    }

    #[test]
    fn test_validate_rejects_readonly_save() {
        let config = ServicingConfig {
            read_only: true,
            save_changes: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ServicingError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_append_without_save() {
        let config = ServicingConfig {
            save_changes: false,
            append: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ServicingError::Config(_))
        ));
    }

    #[test]
    fn test_validate_accepts_discard_config() {
        let config = ServicingConfig {
            read_only: true,
            save_changes: false,
            ..Default::default()
        };
        config.validate().unwrap();
    }
}
