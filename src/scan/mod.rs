//! Folder scanner: a single async walk of the data directory
//! that groups files into `Folder` records, owner by owner, according to the
//! configured folder-structure template, applying the ignore-old/ignore-new
//! time filters and include/exclude glob lists.
//!
//! The recursive walk is stack-based over `tokio::fs::read_dir` (no
//! recursion, absolute paths out).

pub mod error;
pub mod glob;
pub mod template;

use crate::events::{EventSender, MessageLevel, PipelineEvent};
use crate::model::{Folder, FolderFile, Group, Owner, User};
use crate::scan::error::ScanError;
use crate::scan::glob::GlobPattern;
use crate::settings::Settings;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Walk `settings.data_directory` and group files into `Folder` records.
///
/// An empty data directory, or a template that yields zero owner folders, is
/// not an error: an empty `Vec` is returned and the caller is
/// expected to surface the "no folders found" message itself.
pub async fn scan_folders(settings: &Settings, events: &EventSender) -> Result<Vec<Folder>> {
    let started = Instant::now();
    let root = settings.data_directory_path();
    debug!("[PHASE: scan] [STEP: walk] scan_folders entered (root={:?})", root);

    let includes = load_pattern_file(settings.use_includes_file, &settings.includes_file)
        .context("failed to load includes file")?;
    let excludes = load_pattern_file(settings.use_excludes_file, &settings.excludes_file)
        .context("failed to load excludes file")?;

    let all_files = collect_files_recursive(&root).await?;
    debug!(
        "[PHASE: scan] [STEP: walk] found {} candidate files under {:?}",
        all_files.len(),
        root
    );

    let now = Utc::now();
    let new_cutoff = if settings.ignore_new_files {
        Some(now - ChronoDuration::minutes(settings.ignore_new_files_minutes as i64))
    } else {
        None
    };
    let old_cutoff = if settings.ignore_old_datasets {
        Some(now - ignore_interval(settings.ignore_interval_number, &settings.ignore_interval_unit))
    } else {
        None
    };

    // owner_key -> (dataset folder relative dir -> Folder)
    let mut folders: BTreeMap<String, BTreeMap<PathBuf, Folder>> = BTreeMap::new();
    let mut owners: BTreeMap<String, Arc<Owner>> = BTreeMap::new();
    let mut skipped_by_filter = 0usize;

    for path in &all_files {
        let relative = match path.strip_prefix(&root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let components: Vec<&str> = relative
            .parent()
            .map(|p| p.iter().filter_map(|c| c.to_str()).collect())
            .unwrap_or_default();

        let file_name = match relative.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };

        if !passes_glob_filters(file_name, &includes, &excludes) {
            skipped_by_filter += 1;
            continue;
        }

        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {:?}", path))?;
        let modified: DateTime<Utc> = metadata.modified().map(DateTime::<Utc>::from).unwrap_or(now);

        if let Some(cutoff) = new_cutoff {
            if modified > cutoff {
                skipped_by_filter += 1;
                continue;
            }
        }
        if let Some(cutoff) = old_cutoff {
            if modified < cutoff {
                skipped_by_filter += 1;
                continue;
            }
        }

        let matched = template::match_template(settings.folder_structure, &components)
            .with_context(|| format!("invalid folder structure at {:?}", relative))?;

        let owner = owners
            .entry(matched.owner_key.clone())
            .or_insert_with(|| {
                Arc::new(if matched.is_group {
                    Owner::Group(Group {
                        name: matched.owner_key.clone(),
                        server_id: None,
                    })
                } else {
                    Owner::User(User {
                        upstream_id: matched.owner_key.clone(),
                        server_id: None,
                        no_server_mapping: false,
                    })
                })
            })
            .clone();

        let dataset_dir: PathBuf = relative.parent().map(Path::to_path_buf).unwrap_or_default();
        let owner_folders = folders.entry(matched.owner_key.clone()).or_default();
        let folder = owner_folders.entry(dataset_dir.clone()).or_insert_with(|| Folder {
            owner: owner.clone(),
            experiment_title: matched.experiment_title.clone(),
            dataset_name: matched.dataset_name.clone(),
            local_path: root.join(&dataset_dir),
            files: Vec::new(),
            created_date: now,
            experiment_ref: None,
            dataset_ref: None,
        });

        folder.files.push(FolderFile {
            relative_path: file_name.to_string(),
            modified,
            size: metadata.len(),
        });
    }

    let total_owners = folders.len();
    let mut result = Vec::new();
    for (scanned, (_owner_key, owner_folders)) in folders.into_iter().enumerate() {
        result.extend(owner_folders.into_values());
        let _ = events.send(PipelineEvent::ScanProgress {
            scanned: scanned + 1,
            total: total_owners,
        });
    }

    if result.is_empty() {
        let _ = events.send(PipelineEvent::Message {
            level: MessageLevel::Info,
            text: "No folders were found to upload from.".to_string(),
        });
    }

    info!(
        "[PHASE: scan] [STEP: walk] scan_folders exit (folders={}, skipped_by_filter={}, duration_ms={})",
        result.len(),
        skipped_by_filter,
        started.elapsed().as_millis()
    );
    Ok(result)
}

/// Recursively collect all regular files under `root`. Absolute paths out.
async fn collect_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("read_dir failed: {:?}", dir)),
        };
        while let Some(ent) = rd.next_entry().await? {
            let p = ent.path();
            let meta = ent.metadata().await?;
            if meta.is_dir() {
                stack.push(p);
            } else if meta.is_file() {
                out.push(p);
            }
        }
    }
    Ok(out)
}

fn load_pattern_file(enabled: bool, path: &str) -> Result<Vec<GlobPattern>> {
    if !enabled || path.trim().is_empty() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read pattern file {:?}", path))?;
    Ok(glob::parse_pattern_file(&contents).map_err(|source| ScanError::InvalidGlob {
        path: path.to_string(),
        source,
    })?)
}

fn passes_glob_filters(file_name: &str, includes: &[GlobPattern], excludes: &[GlobPattern]) -> bool {
    if !includes.is_empty() && !includes.iter().any(|p| p.is_match(file_name)) {
        return false;
    }
    if excludes.iter().any(|p| p.is_match(file_name)) {
        return false;
    }
    true
}

fn ignore_interval(number: u32, unit: &str) -> ChronoDuration {
    match unit.to_ascii_lowercase().as_str() {
        "days" | "day" => ChronoDuration::days(number as i64),
        "weeks" | "week" => ChronoDuration::weeks(number as i64),
        "years" | "year" => ChronoDuration::days(number as i64 * 365),
        _ => ChronoDuration::days(number as i64 * 30), // "months" has no fixed length; approximate
    }
}
