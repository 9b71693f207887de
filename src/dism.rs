// ============================================
// ImageSmith - dism.rs
// ============================================
// The OS image-servicing boundary.
//
// DISM (Deployment Image Servicing and Management) is the Windows tool
// that mounts WIM/ESD images so their contents can be modified. All
// DISM invocations live behind the ImageBackend trait so the lifecycle
// logic in session.rs can be exercised against a fake in tests; the
// native calls themselves are opaque and never reimplemented.
// ============================================

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{Result, ServicingError};
use crate::image::ImageIndexInfo;

/// The OS-level image mount/unmount/enumerate primitives.
///
/// Implementations must treat every call as a long-running blocking
/// operation: mounting or committing a large image can take minutes and
/// cannot be interrupted safely once started.
pub trait ImageBackend: Send + Sync {
    /// Mount one index of a container into `mount_dir`.
    fn mount_image(
        &self,
        container: &Path,
        mount_dir: &Path,
        index: u32,
        read_only: bool,
    ) -> Result<()>;

    /// Unmount the image at `mount_dir`, committing or discarding changes.
    /// `append` is passed through to the commit unchanged and is only
    /// meaningful when `commit` is true.
    fn unmount_image(&self, mount_dir: &Path, commit: bool, append: bool) -> Result<()>;

    /// List the indices of a container with their identity metadata.
    fn container_indices(&self, container: &Path) -> Result<Vec<ImageIndexInfo>>;

    /// Clean up orphaned mounts left behind by crashed runs.
    fn cleanup_orphaned(&self) -> Result<()>;
}

// ============================================
// DISM IMPLEMENTATION
// ============================================

/// Shells out to `dism`, which is built into Windows.
pub struct Dism;

impl Dism {
    /// Run dism with the given arguments and return its stdout.
    ///
    /// Non-zero exit is turned into an error carrying both stdout and
    /// stderr, since DISM writes most of its diagnostics to stdout.
    fn run(&self, args: &[String]) -> std::result::Result<String, String> {
        debug!(?args, "running dism");

        let output = Command::new("dism")
            .args(args)
            .output()
            .map_err(|e| format!("Failed to run DISM: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{}\n{}", stdout.trim(), stderr.trim()));
        }

        Ok(stdout)
    }
}

impl ImageBackend for Dism {
    fn mount_image(
        &self,
        container: &Path,
        mount_dir: &Path,
        index: u32,
        read_only: bool,
    ) -> Result<()> {
        // Command: dism /Mount-Wim /WimFile:path /Index:1 /MountDir:path [/ReadOnly]
        let mut args = vec![
            "/Mount-Wim".to_string(),
            format!("/WimFile:{}", container.display()),
            format!("/Index:{}", index),
            format!("/MountDir:{}", mount_dir.display()),
        ];
        if read_only {
            args.push("/ReadOnly".to_string());
        }

        self.run(&args).map_err(|detail| {
            ServicingError::mount_failed(
                mount_dir,
                format!(
                    "{}\n\
                     What to do:\n\
                     1. Run from an elevated prompt (DISM requires Administrator)\n\
                     2. Run 'dism /Cleanup-Wim' to clear stale mounts\n\
                     3. Check that no antivirus is blocking DISM operations",
                    detail
                ),
            )
        })?;
        Ok(())
    }

    fn unmount_image(&self, mount_dir: &Path, commit: bool, append: bool) -> Result<()> {
        // Command: dism /Unmount-Wim /MountDir:path /Commit (or /Discard)
        let mut args = vec![
            "/Unmount-Wim".to_string(),
            format!("/MountDir:{}", mount_dir.display()),
            if commit { "/Commit" } else { "/Discard" }.to_string(),
        ];
        if commit && append {
            args.push("/Append".to_string());
        }

        self.run(&args)
            .map_err(|detail| ServicingError::dismount_failed(mount_dir, detail))?;
        Ok(())
    }

    fn container_indices(&self, container: &Path) -> Result<Vec<ImageIndexInfo>> {
        // Summary listing first: dism /Get-WimInfo /WimFile:path
        let summary = self
            .run(&[
                "/Get-WimInfo".to_string(),
                format!("/WimFile:{}", container.display()),
            ])
            .map_err(|detail| ServicingError::container_unreadable(container, detail))?;

        let mut infos = Vec::new();
        for (index, name, size_bytes) in parse_wiminfo_summary(&summary) {
            // Per-index detail adds edition and architecture
            let detail = self
                .run(&[
                    "/Get-WimInfo".to_string(),
                    format!("/WimFile:{}", container.display()),
                    format!("/Index:{}", index),
                ])
                .map_err(|detail| ServicingError::container_unreadable(container, detail))?;
            let (edition, architecture) = parse_wiminfo_detail(&detail);

            infos.push(ImageIndexInfo {
                source_path: container.to_path_buf(),
                index,
                name,
                edition,
                architecture,
                size_bytes,
            });
        }

        if infos.is_empty() {
            return Err(ServicingError::container_unreadable(
                container,
                "DISM reported no image indices",
            ));
        }

        Ok(infos)
    }

    fn cleanup_orphaned(&self) -> Result<()> {
        // Command: dism /Cleanup-Wim
        // Nothing-to-do is still success; DISM says so on stdout.
        let stdout = self
            .run(&["/Cleanup-Wim".to_string()])
            .map_err(|detail| ServicingError::DismountFailed {
                path: std::path::PathBuf::new(),
                detail,
            })?;
        debug!(output = %stdout.trim(), "dism cleanup finished");
        Ok(())
    }
}

// ============================================
// OUTPUT PARSING
// ============================================
// DISM prints "Key : Value" blocks separated by blank lines. The
// summary listing yields one block per index; the per-index query adds
// fields like Architecture and Edition.

/// Extract the value of a "Key : Value" line, if the key matches.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (k, v) = line.split_once(':')?;
    if k.trim().eq_ignore_ascii_case(key) {
        Some(v.trim())
    } else {
        None
    }
}

/// Parse the summary listing into (index, name, size_bytes) tuples.
pub(crate) fn parse_wiminfo_summary(output: &str) -> Vec<(u32, String, u64)> {
    let mut result: Vec<(u32, String, u64)> = Vec::new();
    let mut current: Option<u32> = None;
    let mut name = String::new();
    let mut size: u64 = 0;

    for line in output.lines() {
        if let Some(value) = field(line, "Index") {
            // Starting a new block; flush the previous one
            if let Some(index) = current.take() {
                result.push((index, std::mem::take(&mut name), size));
                size = 0;
            }
            current = value.parse().ok();
        } else if let Some(value) = field(line, "Name") {
            name = value.to_string();
        } else if let Some(value) = field(line, "Size") {
            size = parse_size_bytes(value);
        }
    }
    if let Some(index) = current {
        result.push((index, name, size));
    }

    result
}

/// Parse the per-index detail block into (edition, architecture).
///
/// Older images may not carry an edition; DISM then prints
/// "<undefined>", which is normalized to an empty string.
pub(crate) fn parse_wiminfo_detail(output: &str) -> (String, String) {
    let mut edition = String::new();
    let mut architecture = String::new();

    for line in output.lines() {
        if let Some(value) = field(line, "Edition") {
            edition = normalize_field(value);
        } else if let Some(value) = field(line, "Architecture") {
            architecture = normalize_field(value);
        }
    }

    (edition, architecture)
}

fn normalize_field(value: &str) -> String {
    if value.eq_ignore_ascii_case("<undefined>") {
        String::new()
    } else {
        value.to_string()
    }
}

/// Parse DISM's "16,123,456,789 bytes" size format.
fn parse_size_bytes(value: &str) -> u64 {
    value
        .trim_end_matches("bytes")
        .trim()
        .replace(',', "")
        .replace('.', "")
        .parse()
        .unwrap_or(0)
}

// ============================================
// TESTS
// ============================================
