// ============================================
// ImageSmith - batch.rs
// ============================================
// Batch orchestration.
//
// Drives N mount/process/dismount cycles over a filtered index list,
// strictly sequential and in the given order. One failing item never
// takes the batch down: its error is captured in the per-item result
// and, depending on policy, the batch continues or marks the remaining
// items skipped.
// ============================================

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::config::ServicingConfig;
use crate::error::{Result, ServicingError};
use crate::image::ImageIndexInfo;
use crate::mount_dir::MountDirAllocator;
use crate::session::{DismountOptions, MountSession, MountState, SessionManager};

/// Outcome of one batch item.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "message")]
pub enum BatchOutcome {
    /// Mounted, processed, and dismounted cleanly.
    Succeeded,
    /// The item failed; the message is the captured error.
    Failed(String),
    /// Dismount failed but the mount directory was force-removed.
    /// The commit was NOT verified. Counted as a failure.
    Forced(String),
    /// Never attempted because an earlier item stopped the batch.
    Skipped,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Succeeded)
    }
}

/// One processed (or skipped) index.
#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub index: u32,
    pub image_name: String,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
    /// Mount id of the session, when one was opened.
    pub mount_id: Option<String>,
    /// Pass-through result of the processing stage, when it produced one.
    pub stage_result: Option<serde_json::Value>,
}

/// Aggregated result of a whole batch run.
///
/// Owned by the orchestrator while the batch runs; handed to the caller
/// afterwards and never mutated again.
#[derive(Debug, Default, Serialize)]
pub struct BatchResult {
    pub items: Vec<BatchItem>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchResult {
    fn push(&mut self, item: BatchItem) {
        match item.outcome {
            BatchOutcome::Succeeded => self.succeeded += 1,
            BatchOutcome::Failed(_) | BatchOutcome::Forced(_) => self.failed += 1,
            BatchOutcome::Skipped => self.skipped += 1,
        }
        self.items.push(item);
    }

    /// Err with `PartialBatchFailure` when any item failed.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.failed > 0 {
            Err(ServicingError::PartialBatchFailure {
                failed: self.failed,
                total: self.items.len(),
            })
        } else {
            Ok(())
        }
    }

    /// Human-readable per-item summary with totals.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            let line = match &item.outcome {
                BatchOutcome::Succeeded => {
                    format!("  [OK]      index {} ({})", item.index, item.image_name)
                }
                BatchOutcome::Failed(message) => format!(
                    "  [FAILED]  index {} ({}): {}",
                    item.index, item.image_name, message
                ),
                BatchOutcome::Forced(message) => format!(
                    "  [FORCED]  index {} ({}): mount dir removed, commit NOT verified: {}",
                    item.index, item.image_name, message
                ),
                BatchOutcome::Skipped => {
                    format!("  [SKIPPED] index {} ({})", item.index, item.image_name)
                }
            };
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&format!(
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        ));
        out
    }

    /// Write the result as JSON for tooling to consume.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ServicingError::Config(format!("cannot serialize summary: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Processing stage invoked per mounted session. The returned value is
/// attached to the session and the batch item unchanged.
pub type StageFn<'a> = dyn FnMut(&mut MountSession) -> Result<serde_json::Value> + 'a;

// ============================================
// ORCHESTRATOR
// ============================================

/// Runs mount/process/dismount cycles over a set of indices.
pub struct BatchOrchestrator<'a> {
    config: &'a ServicingConfig,
    allocator: &'a MountDirAllocator,
    sessions: &'a SessionManager,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        config: &'a ServicingConfig,
        allocator: &'a MountDirAllocator,
        sessions: &'a SessionManager,
    ) -> Self {
        Self {
            config,
            allocator,
            sessions,
        }
    }

    /// Process every index in order: allocate, mount, run the stage,
    /// dismount with the configured policy.
    ///
    /// Items are never re-ordered and never run in parallel: the OS
    /// image API serializes access to a single container file, and a
    /// strictly sequential batch keeps behavior predictable. When
    /// `continue_on_error` is off, the first failure marks all
    /// remaining items `Skipped`.
    pub fn process_all(&self, indices: &[ImageIndexInfo], stage: &mut StageFn) -> BatchResult {
        let mut result = BatchResult::default();
        if indices.is_empty() {
            return result;
        }

        if self.config.cleanup_at_start {
            self.allocator
                .prune_stale(&self.sessions.active_mount_paths());
            if let Err(e) = self.sessions.cleanup_orphaned() {
                debug!(error = %e, "orphaned-mount cleanup pass failed; continuing");
            }
        }

        // One group id per batch: all sessions of this invocation share it
        let group_id = MountDirAllocator::new_group_id();
        let total = indices.len();
        let mut stopped = false;

        for (position, info) in indices.iter().enumerate() {
            if stopped {
                result.push(BatchItem {
                    index: info.index,
                    image_name: info.name.clone(),
                    outcome: BatchOutcome::Skipped,
                    mount_id: None,
                    stage_result: None,
                });
                continue;
            }

            let item = self.process_one(info, &group_id, position + 1, total, stage);
            let failed = !item.outcome.is_success();
            result.push(item);

            if failed && !self.config.continue_on_error {
                stopped = true;
            }
        }

        result
    }

    /// One allocate/mount/stage/dismount cycle.
    fn process_one(
        &self,
        info: &ImageIndexInfo,
        group_id: &str,
        position: usize,
        total: usize,
        stage: &mut StageFn,
    ) -> BatchItem {
        self.sessions.progress().item(
            position,
            total,
            &format!("{} (index {})", info.name, info.index),
        );

        let fail = |message: String| BatchItem {
            index: info.index,
            image_name: info.name.clone(),
            outcome: BatchOutcome::Failed(message),
            mount_id: None,
            stage_result: None,
        };

        let mount_path = match self.allocator.allocate(group_id, info.index) {
            Ok(path) => path,
            Err(e) => return fail(e.to_string()),
        };

        let mut session = self.sessions.mount(
            &info.source_path,
            info.index,
            group_id,
            &mount_path,
            self.config.read_only,
        );
        if session.state() != MountState::Mounted {
            let message = session
                .error_message
                .take()
                .unwrap_or_else(|| "mount failed".to_string());
            return fail(message);
        }

        let stage_error = match stage(&mut session) {
            Ok(value) => {
                session.last_stage_result = Some(value);
                None
            }
            Err(e) => Some(e.to_string()),
        };

        // A failed stage must not leave the image mounted; its changes
        // are discarded instead of committed.
        let opts = if stage_error.is_some() {
            DismountOptions {
                save: false,
                append: false,
                force: self.config.force_unmount,
                remove_dir: self.config.remove_mount_dirs,
            }
        } else {
            DismountOptions::from_config(self.config)
        };

        let dismounted = self.sessions.dismount(&mut session, &opts);

        let outcome = match (stage_error, dismounted) {
            (Some(message), Ok(_)) => {
                BatchOutcome::Failed(format!("processing stage failed: {}", message))
            }
            (Some(message), Err(dismount)) => BatchOutcome::Failed(format!(
                "processing stage failed: {}; dismount also failed: {}",
                message, dismount
            )),
            (None, Ok(MountState::ForciblyUnmounted)) => BatchOutcome::Forced(
                session
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unmount failed".to_string()),
            ),
            (None, Ok(_)) => BatchOutcome::Succeeded,
            (None, Err(e)) => BatchOutcome::Failed(e.to_string()),
        };

        BatchItem {
            index: info.index,
            image_name: info.name.clone(),
            outcome,
            mount_id: Some(session.mount_id.to_string()),
            stage_result: session.last_stage_result.take(),
        }
    }
}

// ============================================
// TESTS
// ============================================
