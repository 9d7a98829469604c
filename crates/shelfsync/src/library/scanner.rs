use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use crate::config::LibraryConfig;
use crate::error::ScanError;
use crate::remote::DocumentIndex;
use crate::upload::{FileState, NewFile, Registration, StateManager};

/// Which files under the root are part of the library.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Lower-case extensions without the dot. Empty accepts everything.
    pub extensions: Vec<String>,
    /// Glob patterns matched against paths relative to the root.
    pub exclude: Vec<String>,
    pub include_hidden: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from(&LibraryConfig::default())
    }
}

impl From<&LibraryConfig> for ScanOptions {
    fn from(config: &LibraryConfig) -> Self {
        Self {
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            exclude: config.exclude.clone(),
            include_hidden: config.include_hidden,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    /// Newly registered files.
    pub discovered: usize,
    /// Known files whose content changed.
    pub changed: usize,
    pub unchanged: usize,
    /// Changed files left alone because an upload is in flight.
    pub in_flight: usize,
    pub errors: Vec<String>,
}

/// Hex-encoded SHA-256 of the file content.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Walks `root` and registers every library file with the state store.
///
/// A known file whose fingerprint changed has its indexed copy deleted
/// remotely and returns to `untracked`. When the delete fails the file is
/// marked failed and keeps its old fingerprint, so the next scan retries.
pub async fn scan_directory(
    state: &StateManager,
    index: &dyn DocumentIndex,
    root: &Path,
    options: &ScanOptions,
) -> Result<ScanReport, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::RootNotFound(root.to_path_buf()));
    }
    let root = root
        .canonicalize()
        .map_err(|_| ScanError::RootNotFound(root.to_path_buf()))?;
    let excludes = compile_excludes(&options.exclude)?;

    let mut report = ScanReport::default();
    for path in collect_candidates(&root, options, &excludes, &mut report) {
        if let Err(e) = scan_file(state, index, &path, &mut report).await {
            warn!("Failed to register {}: {}", path.display(), e);
            report.errors.push(format!("{}: {}", path.display(), e));
        }
    }

    info!(
        "Scan of {} complete: {} new, {} changed, {} unchanged, {} in flight, {} errors",
        root.display(),
        report.discovered,
        report.changed,
        report.unchanged,
        report.in_flight,
        report.errors.len()
    );
    Ok(report)
}

fn compile_excludes(patterns: &[String]) -> Result<Vec<glob::Pattern>, ScanError> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| ScanError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

fn collect_candidates(
    root: &Path,
    options: &ScanOptions,
    excludes: &[glob::Pattern],
    report: &mut ScanReport,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| options.include_hidden || !is_hidden(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                report.errors.push(e.to_string());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if excludes.iter().any(|p| p.matches_path(relative)) {
            debug!("Excluded: {}", relative.display());
            continue;
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let allowed = options.extensions.is_empty()
            || extension
                .as_ref()
                .is_some_and(|ext| options.extensions.contains(ext));
        if !allowed {
            debug!("Unsupported extension: {}", relative.display());
            continue;
        }

        candidates.push(path.to_path_buf());
    }
    candidates
}

async fn scan_file(
    state: &StateManager,
    index: &dyn DocumentIndex,
    path: &Path,
    report: &mut ScanReport,
) -> Result<(), ScanError> {
    let io_error = |source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    };
    let metadata = std::fs::metadata(path).map_err(io_error)?;
    let fingerprint = fingerprint_file(path).map_err(io_error)?;
    let new_file = NewFile {
        path: path.to_string_lossy().into_owned(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
        mime_type: mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string()),
        content_fingerprint: fingerprint,
    };

    match state.register_file(&new_file)? {
        Registration::New => {
            debug!("Registered {}", new_file.path);
            report.discovered += 1;
        }
        Registration::Unchanged => report.unchanged += 1,
        Registration::Changed(existing) => {
            if matches!(existing.state, FileState::Uploading | FileState::Processing) {
                info!("{} changed during an upload; rescan later", new_file.path);
                report.in_flight += 1;
                return Ok(());
            }

            let remote_deleted = match existing.remote_doc_id.as_deref() {
                Some(doc_id) => match index.delete_document(doc_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Could not delete stale document {} for {}: {}",
                            doc_id, new_file.path, e
                        );
                        false
                    }
                },
                None => true,
            };

            let now = state.mark_index_stale(
                &new_file.path,
                &new_file.content_fingerprint,
                new_file.size_bytes,
                remote_deleted,
            )?;
            info!("{} changed on disk; now {}", new_file.path, now);
            report.changed += 1;
        }
    }
    Ok(())
}
