// ============================================
// ImageSmith - image.rs
// ============================================
// Image enumeration and index filtering.
//
// Enumeration opens a WIM/ESD container and lists its indices with
// identity metadata, without mounting anything. Filtering is the
// caller's business: inclusion/exclusion predicates are plain function
// values applied to the enumerated list before any mount is requested.
// ============================================

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::dism::ImageBackend;
use crate::error::{Result, ServicingError};

/// Immutable description of one index inside a container file.
///
/// Produced by enumeration, consumed to open a mount session, never
/// mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct ImageIndexInfo {
    /// Path of the WIM/ESD container this index lives in.
    pub source_path: PathBuf,

    /// 1-based image index within the container.
    pub index: u32,

    /// Image name, e.g. "Windows 11 Pro".
    pub name: String,

    /// Edition ID, e.g. "Professional". Empty if the image has none.
    pub edition: String,

    /// Architecture, e.g. "x64". Empty if the image reports none.
    pub architecture: String,

    /// Uncompressed image size in bytes.
    pub size_bytes: u64,
}

/// Container extensions the enumerator accepts.
const SUPPORTED_EXTENSIONS: [&str; 3] = ["wim", "esd", "swm"];

/// List the indices of a WIM/ESD container.
///
/// ISOs are explicitly unsupported here: the ISO must be extracted or
/// mounted externally and the contained WIM/ESD path passed instead.
///
/// # Arguments
/// * `backend` - OS image backend (DISM in production)
/// * `container` - Path to the .wim/.esd file
///
/// # Returns
/// One `ImageIndexInfo` per index, in container order.
pub fn list_indices(backend: &dyn ImageBackend, container: &Path) -> Result<Vec<ImageIndexInfo>> {
    let extension = container
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    if extension == "iso" {
        return Err(ServicingError::UnsupportedContainerFormat {
            path: container.to_path_buf(),
        });
    }

    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ServicingError::container_unreadable(
            container,
            format!("'{}' is not a WIM/ESD container", extension),
        ));
    }

    if !container.is_file() {
        return Err(ServicingError::container_unreadable(
            container,
            "file not found",
        ));
    }

    backend.container_indices(container)
}

// ============================================
// INDEX FILTERING
// ============================================

/// Predicate over an enumerated index.
pub type IndexPredicate = Box<dyn Fn(&ImageIndexInfo) -> Result<bool> + Send + Sync>;

/// Inclusion/exclusion filter applied to an enumerated index list.
///
/// Inclusion runs before exclusion. A predicate that fails to evaluate
/// keeps the item (fail-open) and logs a warning; callers that need
/// fail-closed semantics must handle errors inside their predicate.
#[derive(Default)]
pub struct IndexFilter {
    include: Option<IndexPredicate>,
    exclude: Option<IndexPredicate>,
}

impl IndexFilter {
    /// A filter that keeps everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Keep only indices matching the predicate.
    pub fn include(mut self, predicate: IndexPredicate) -> Self {
        self.include = Some(predicate);
        self
    }

    /// Drop indices matching the predicate. Applied after inclusion.
    pub fn exclude(mut self, predicate: IndexPredicate) -> Self {
        self.exclude = Some(predicate);
        self
    }

    /// Keep only the given index numbers. Convenience for the CLI.
    pub fn only_indices(indices: Vec<u32>) -> Self {
        Self::all().include(Box::new(move |info| Ok(indices.contains(&info.index))))
    }

    /// Apply the filter to an enumerated list, preserving order.
    pub fn apply(&self, items: Vec<ImageIndexInfo>) -> Vec<ImageIndexInfo> {
        items
            .into_iter()
            .filter(|item| {
                if let Some(include) = &self.include {
                    match include(item) {
                        Ok(true) => {}
                        Ok(false) => return false,
                        Err(e) => {
                            warn!(index = item.index, error = %e,
                                "include predicate failed to evaluate; keeping item");
                        }
                    }
                }
                if let Some(exclude) = &self.exclude {
                    match exclude(item) {
                        Ok(true) => return false,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(index = item.index, error = %e,
                                "exclude predicate failed to evaluate; keeping item");
                        }
                    }
                }
                true
            })
            .collect()
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn info(index: u32, name: &str) -> ImageIndexInfo {
        ImageIndexInfo {
            source_path: PathBuf::from("install.wim"),
            index,
            name: name.to_string(),
            edition: String::new(),
            architecture: "x64".to_string(),
            size_bytes: 0,
        }
    }

    fn sample() -> Vec<ImageIndexInfo> {
        vec![info(1, "Home"), info(2, "Pro"), info(3, "Pro N")]
    }

    #[test]
    fn test_filter_all_keeps_everything() {
        let kept = IndexFilter::all().apply(sample());
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_include_before_exclude() {
        let filter = IndexFilter::all()
            .include(Box::new(|i| Ok(i.name.contains("Pro"))))
            .exclude(Box::new(|i| Ok(i.name.ends_with('N'))));

        let kept = filter.apply(sample());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].index, 2);
    }

    #[test]
    fn test_only_indices() {
        let kept = IndexFilter::only_indices(vec![1, 3]).apply(sample());
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].index, 1);
        assert_eq!(kept[1].index, 3);
    }

    #[test]
    fn test_failing_exclude_is_fail_open() {
        let filter = IndexFilter::all().exclude(Box::new(|i| {
            if i.index == 2 {
                Err(ServicingError::InvalidOperation("boom".to_string()))
            } else {
                Ok(false)
            }
        }));

        // Index 2's predicate errored, but the item is kept
        let kept = filter.apply(sample());
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_order_preserved() {
        let kept = IndexFilter::all()
            .include(Box::new(|_| Ok(true)))
            .apply(sample());
        let indices: Vec<u32> = kept.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }
}
