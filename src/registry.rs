// ============================================
// ImageSmith - registry.rs
// ============================================
// Offline registry hive handling.
//
// A mounted image carries its registry hives as plain files under
// Windows\System32\config. To read or edit them, a hive file is loaded
// into the live registry under a temporary key, modified through the
// normal registry commands, and unloaded again. An unloaded hive is
// non-negotiable: a hive left loaded keeps the OS from dismounting the
// image, so every load is scoped to a HiveMount guard that unloads on
// every exit path, including drop during unwinding.
//
// One interface serves both read-only probing and write servicing;
// write intent is declared at load time and enforced on the handle.
// ============================================

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, ServicingError};
use crate::session::MountSession;

/// Well-known hive file names under Windows\System32\config.
pub mod hives {
    pub const SOFTWARE: &str = "SOFTWARE";
    pub const SYSTEM: &str = "SYSTEM";
    pub const SECURITY: &str = "SECURITY";
    pub const SAM: &str = "SAM";
    /// The default user profile hive. Lowercase on disk.
    pub const DEFAULT: &str = "default";
}

/// A registry value as read back from a key.
#[derive(Debug, Clone, PartialEq)]
pub enum RegValue {
    /// REG_SZ / REG_EXPAND_SZ
    Sz(String),
    /// REG_DWORD
    Dword(u32),
    /// Anything else, kept as (type name, raw textual data).
    Raw { kind: String, data: String },
}

/// The OS registry primitives, scoped to hive load/unload and key
/// operations under a loaded temp key.
///
/// Load/unload return the raw status code: 0 means success, anything
/// else is surfaced by the controller as a typed error, never swallowed.
pub trait RegistryBackend: Send + Sync {
    /// Load a hive file under `HKLM\{temp_key}`.
    fn load_hive(&self, temp_key: &str, hive_file: &Path) -> Result<i32>;

    /// Unload the hive at `HKLM\{temp_key}`.
    fn unload_hive(&self, temp_key: &str) -> Result<i32>;

    /// Create or overwrite a value. `key_path` is relative to HKLM.
    fn set_value(&self, key_path: &str, name: &str, value: &RegValue) -> Result<()>;

    /// Read one value. `Ok(None)` when the key or value does not exist.
    fn query_value(&self, key_path: &str, name: &str) -> Result<Option<RegValue>>;

    /// List direct subkey names. Empty when the key does not exist.
    fn enumerate_subkeys(&self, key_path: &str) -> Result<Vec<String>>;

    /// List (name, value) pairs of a key. Empty when the key does not exist.
    fn enumerate_values(&self, key_path: &str) -> Result<Vec<(String, RegValue)>>;

    /// Delete one value. Missing values are not an error.
    fn delete_value(&self, key_path: &str, name: &str) -> Result<()>;
}

// ============================================
// REG.EXE IMPLEMENTATION
// ============================================

/// Shells out to `reg.exe`, which is built into Windows (and WinPE).
pub struct RegTool;

impl RegTool {
    fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "running reg");
        Command::new("reg")
            .args(args)
            .output()
            .map_err(ServicingError::Io)
    }
}

impl RegistryBackend for RegTool {
    fn load_hive(&self, temp_key: &str, hive_file: &Path) -> Result<i32> {
        let key = format!("HKLM\\{}", temp_key);
        let output = self.run(&["load", &key, &hive_file.to_string_lossy()])?;
        Ok(output.status.code().unwrap_or(-1))
    }

    fn unload_hive(&self, temp_key: &str) -> Result<i32> {
        let key = format!("HKLM\\{}", temp_key);
        let output = self.run(&["unload", &key])?;
        Ok(output.status.code().unwrap_or(-1))
    }

    fn set_value(&self, key_path: &str, name: &str, value: &RegValue) -> Result<()> {
        let key = format!("HKLM\\{}", key_path);
        let (kind, data) = match value {
            RegValue::Sz(s) => ("REG_SZ", s.clone()),
            RegValue::Dword(d) => ("REG_DWORD", d.to_string()),
            RegValue::Raw { kind, data } => (kind.as_str(), data.clone()),
        };

        let output = self.run(&["add", &key, "/v", name, "/t", kind, "/d", &data, "/f"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServicingError::InvalidOperation(format!(
                "reg add {} /v {} failed: {}",
                key,
                name,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn query_value(&self, key_path: &str, name: &str) -> Result<Option<RegValue>> {
        let key = format!("HKLM\\{}", key_path);
        let output = self.run(&["query", &key, "/v", name])?;
        if !output.status.success() {
            // reg query exits 1 for missing keys/values; absence is an
            // expected outcome when probing unknown offline images
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_query_values(&stdout)
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v))
    }

    fn enumerate_subkeys(&self, key_path: &str) -> Result<Vec<String>> {
        let key = format!("HKLM\\{}", key_path);
        let output = self.run(&["query", &key])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }

        // reg echoes keys with the expanded root name
        let expanded = format!("HKEY_LOCAL_MACHINE\\{}", key_path);
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_query_subkeys(&stdout, &expanded))
    }

    fn enumerate_values(&self, key_path: &str) -> Result<Vec<(String, RegValue)>> {
        let key = format!("HKLM\\{}", key_path);
        let output = self.run(&["query", &key])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_query_values(&stdout))
    }

    fn delete_value(&self, key_path: &str, name: &str) -> Result<()> {
        let key = format!("HKLM\\{}", key_path);
        // Missing values are fine; only surface real failures
        let _ = self.run(&["delete", &key, "/v", name, "/f"])?;
        Ok(())
    }
}

// ============================================
// REG QUERY OUTPUT PARSING
// ============================================
// reg query prints the key path, then values as
//     "    Name    REG_SZ    data"
// and finally full paths of direct subkeys, one per line.

pub(crate) fn parse_query_values(output: &str) -> Vec<(String, RegValue)> {
    let mut values = Vec::new();
    for line in output.lines() {
        // Value lines are indented; key path lines are not
        if !line.starts_with("    ") {
            continue;
        }
        let mut parts = line.trim().splitn(3, "    ");
        let name = match parts.next() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => continue,
        };
        let kind = match parts.next() {
            Some(k) if k.starts_with("REG_") => k.to_string(),
            _ => continue,
        };
        let data = parts.next().unwrap_or("").to_string();

        let value = match kind.as_str() {
            "REG_SZ" | "REG_EXPAND_SZ" => RegValue::Sz(data),
            "REG_DWORD" => {
                // reg prints DWORDs as 0x1018
                let parsed = u32::from_str_radix(data.trim_start_matches("0x"), 16).unwrap_or(0);
                RegValue::Dword(parsed)
            }
            _ => RegValue::Raw { kind, data },
        };
        values.push((name, value));
    }
    values
}

pub(crate) fn parse_query_subkeys(output: &str, key: &str) -> Vec<String> {
    let prefix = format!("{}\\", key);
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            if line.len() > prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(&prefix) {
                Some(line[prefix.len()..].to_string())
            } else {
                None
            }
        })
        .filter(|name| !name.contains('\\'))
        .collect()
}

// ============================================
// HIVE CONTROLLER
// ============================================

/// Loads and unloads offline hives from a mounted image.
///
/// Tracks which hive files are currently loaded so a raw backup is
/// refused while the on-disk file may be inconsistent.
pub struct HiveController {
    backend: Arc<dyn RegistryBackend>,
    loaded_files: Arc<Mutex<HashSet<PathBuf>>>,
}

impl HiveController {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self {
            backend,
            loaded_files: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Resolve a hive name to its file inside a mounted image.
    fn hive_file(session: &MountSession, hive_name: &str) -> PathBuf {
        session
            .mount_path
            .join("Windows")
            .join("System32")
            .join("config")
            .join(hive_name)
    }

    /// Load a hive from a mounted image under a temporary key.
    ///
    /// Requires a live session: the handle ties hive lifetime inside
    /// the mount lifetime, and dismount refuses while any handle from
    /// the session is still open.
    ///
    /// # Arguments
    /// * `session` - Must be `Mounted`.
    /// * `hive_name` - File name under Windows\System32\config,
    ///   e.g. `hives::SOFTWARE`.
    /// * `write_intent` - Whether modify operations are allowed through
    ///   the returned handle.
    pub fn load(
        &self,
        session: &MountSession,
        hive_name: &str,
        write_intent: bool,
    ) -> Result<HiveMount> {
        if !session.is_mounted() {
            return Err(ServicingError::InvalidOperation(format!(
                "cannot load hive {}: session is {:?}, not Mounted",
                hive_name,
                session.state()
            )));
        }

        let hive_file = Self::hive_file(session, hive_name);
        if !hive_file.is_file() {
            return Err(ServicingError::hive_load_failed(
                hive_name,
                format!("hive file not found: {}", hive_file.display()),
            ));
        }

        let temp_key = format!("IMGSMITH_{}", Uuid::new_v4().simple());
        let status = self.backend.load_hive(&temp_key, &hive_file)?;
        if status != 0 {
            return Err(ServicingError::hive_load_failed(
                hive_name,
                format!("load returned status {}", status),
            ));
        }

        lock_set(&self.loaded_files).insert(hive_file.clone());

        let counter = session.hive_counter();
        counter.fetch_add(1, Ordering::SeqCst);
        debug!(hive = hive_name, temp_key = %temp_key, "hive loaded");

        Ok(HiveMount {
            backend: Arc::clone(&self.backend),
            hive_name: hive_name.to_string(),
            hive_file,
            temp_key,
            write_intent,
            unloaded: false,
            session_hives: counter,
            loaded_files: Arc::clone(&self.loaded_files),
        })
    }

    /// Copy a hive's raw file out of the mounted image.
    ///
    /// The hive must not be loaded: a loaded hive's on-disk state can
    /// be inconsistent, so copying it would back up garbage.
    pub fn backup_hive(
        &self,
        session: &MountSession,
        hive_name: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf> {
        if !session.is_mounted() {
            return Err(ServicingError::InvalidOperation(format!(
                "cannot back up hive {}: session is {:?}, not Mounted",
                hive_name,
                session.state()
            )));
        }

        let hive_file = Self::hive_file(session, hive_name);
        if lock_set(&self.loaded_files).contains(&hive_file) {
            return Err(ServicingError::HiveBusy {
                hive: hive_name.to_string(),
            });
        }

        if !hive_file.is_file() {
            return Err(ServicingError::hive_load_failed(
                hive_name,
                format!("hive file not found: {}", hive_file.display()),
            ));
        }

        fs::create_dir_all(destination_dir)?;
        let destination = destination_dir.join(hive_name);
        fs::copy(&hive_file, &destination)?;
        debug!(hive = hive_name, dest = %destination.display(), "hive backed up");
        Ok(destination)
    }
}

fn lock_set(set: &Arc<Mutex<HashSet<PathBuf>>>) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================
// HIVE MOUNT HANDLE
// ============================================

/// A loaded offline hive, scoped to one read/modify operation.
///
/// Dropping the handle unloads the hive best-effort; call `unload()`
/// explicitly to observe failures. Read operations treat missing keys
/// and values as an expected outcome and return `None`/empty instead
/// of erroring.
pub struct HiveMount {
    backend: Arc<dyn RegistryBackend>,
    hive_name: String,
    hive_file: PathBuf,
    temp_key: String,
    write_intent: bool,
    unloaded: bool,
    session_hives: Arc<AtomicUsize>,
    loaded_files: Arc<Mutex<HashSet<PathBuf>>>,
}

impl std::fmt::Debug for HiveMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiveMount")
            .field("hive_name", &self.hive_name)
            .field("hive_file", &self.hive_file)
            .field("temp_key", &self.temp_key)
            .field("write_intent", &self.write_intent)
            .field("unloaded", &self.unloaded)
            .finish_non_exhaustive()
    }
}

impl HiveMount {
    pub fn hive_name(&self) -> &str {
        &self.hive_name
    }

    /// The temporary key the hive is loaded under (relative to HKLM).
    pub fn temp_key(&self) -> &str {
        &self.temp_key
    }

    /// Key path under the loaded hive, relative to HKLM.
    fn key_path(&self, subkey: &str) -> String {
        if subkey.is_empty() {
            self.temp_key.clone()
        } else {
            format!("{}\\{}", self.temp_key, subkey)
        }
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.unloaded {
            return Err(ServicingError::InvalidOperation(format!(
                "hive {} has already been unloaded",
                self.hive_name
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_loaded()?;
        if !self.write_intent {
            return Err(ServicingError::InvalidOperation(format!(
                "hive {} was loaded for read-only inspection",
                self.hive_name
            )));
        }
        Ok(())
    }

    // ---- read operations ----

    /// Read a string value. `None` when the key or value is absent.
    pub fn read_string(&self, subkey: &str, name: &str) -> Result<Option<String>> {
        self.ensure_loaded()?;
        match self.backend.query_value(&self.key_path(subkey), name)? {
            Some(RegValue::Sz(s)) => Ok(Some(s)),
            Some(RegValue::Raw { data, .. }) => Ok(Some(data)),
            Some(RegValue::Dword(d)) => Ok(Some(d.to_string())),
            None => Ok(None),
        }
    }

    /// Read a DWORD value. `None` when absent or not a DWORD.
    pub fn read_dword(&self, subkey: &str, name: &str) -> Result<Option<u32>> {
        self.ensure_loaded()?;
        match self.backend.query_value(&self.key_path(subkey), name)? {
            Some(RegValue::Dword(d)) => Ok(Some(d)),
            _ => Ok(None),
        }
    }

    /// List direct subkeys. Empty when the key is absent.
    pub fn enumerate_subkeys(&self, subkey: &str) -> Result<Vec<String>> {
        self.ensure_loaded()?;
        self.backend.enumerate_subkeys(&self.key_path(subkey))
    }

    /// List (name, value) pairs. Empty when the key is absent.
    pub fn enumerate_values(&self, subkey: &str) -> Result<Vec<(String, RegValue)>> {
        self.ensure_loaded()?;
        self.backend.enumerate_values(&self.key_path(subkey))
    }

    // ---- write operations (require write intent) ----

    pub fn set_string(&self, subkey: &str, name: &str, data: &str) -> Result<()> {
        self.ensure_writable()?;
        self.backend
            .set_value(&self.key_path(subkey), name, &RegValue::Sz(data.to_string()))
    }

    pub fn set_dword(&self, subkey: &str, name: &str, data: u32) -> Result<()> {
        self.ensure_writable()?;
        self.backend
            .set_value(&self.key_path(subkey), name, &RegValue::Dword(data))
    }

    pub fn delete_value(&self, subkey: &str, name: &str) -> Result<()> {
        self.ensure_writable()?;
        self.backend.delete_value(&self.key_path(subkey), name)
    }

    // ---- unload ----

    /// Unload the hive. Idempotent: a second call is a logged no-op.
    ///
    /// A non-zero unload status is surfaced as an error and the handle
    /// stays open, so the session's dismount will fail loudly instead
    /// of the OS refusing with an opaque sharing violation.
    pub fn unload(&mut self) -> Result<()> {
        if self.unloaded {
            debug!(hive = %self.hive_name, "unload called twice; nothing to do");
            return Ok(());
        }

        let status = self.backend.unload_hive(&self.temp_key)?;
        if status != 0 {
            return Err(ServicingError::InvalidOperation(format!(
                "unload of hive {} returned status {}; \
                 the mount cannot be dismounted until it unloads",
                self.hive_name, status
            )));
        }

        self.mark_unloaded();
        debug!(hive = %self.hive_name, "hive unloaded");
        Ok(())
    }

    fn mark_unloaded(&mut self) {
        self.unloaded = true;
        self.session_hives.fetch_sub(1, Ordering::SeqCst);
        lock_set(&self.loaded_files).remove(&self.hive_file);
    }
}

impl Drop for HiveMount {
    fn drop(&mut self) {
        if self.unloaded {
            return;
        }
        // Unwind path: a failed unload here must not mask whatever
        // error is already propagating, so it is logged and swallowed.
        // The open-hive counter stays up on failure, which makes the
        // session's dismount fail loudly instead of silently.
        match self.backend.unload_hive(&self.temp_key) {
            Ok(0) => self.mark_unloaded(),
            Ok(status) => {
                warn!(hive = %self.hive_name, status,
                    "hive unload failed during cleanup; \
                     the mount will refuse to dismount until it unloads");
            }
            Err(e) => {
                warn!(hive = %self.hive_name, error = %e,
                    "hive unload failed during cleanup");
            }
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY_OUTPUT: &str = "\r\n\
HKEY_LOCAL_MACHINE\\IMGSMITH_abc\\Microsoft\\Windows NT\\CurrentVersion\r\n\
    ProductName    REG_SZ    Windows 11 Pro\r\n\
    CurrentBuild    REG_SZ    22621\r\n\
    InstallDate    REG_DWORD    0x63f4a2b1\r\n\
\r\n\
HKEY_LOCAL_MACHINE\\IMGSMITH_abc\\Microsoft\\Windows NT\\CurrentVersion\\Fonts\r\n\
HKEY_LOCAL_MACHINE\\IMGSMITH_abc\\Microsoft\\Windows NT\\CurrentVersion\\Time Zones\r\n";

    #[test]
    fn test_parse_query_values() {
        let values = parse_query_values(QUERY_OUTPUT);
        assert_eq!(values.len(), 3);
        assert_eq!(
            values[0],
            (
                "ProductName".to_string(),
                RegValue::Sz("Windows 11 Pro".to_string())
            )
        );
        assert_eq!(
            values[2],
            ("InstallDate".to_string(), RegValue::Dword(0x63f4a2b1))
        );
    }

    #[test]
    fn test_parse_query_subkeys() {
        let subkeys = parse_query_subkeys(
            QUERY_OUTPUT,
            "HKEY_LOCAL_MACHINE\\IMGSMITH_abc\\Microsoft\\Windows NT\\CurrentVersion",
        );
        assert_eq!(subkeys, vec!["Fonts".to_string(), "Time Zones".to_string()]);
    }

    #[test]
    fn test_parse_query_subkeys_skips_grandchildren() {
        let output = "\
HKEY_LOCAL_MACHINE\\K\\A\r\n\
HKEY_LOCAL_MACHINE\\K\\A\\Deeper\r\n";
        let subkeys = parse_query_subkeys(output, "HKEY_LOCAL_MACHINE\\K");
        assert_eq!(subkeys, vec!["A".to_string()]);
    }
}
