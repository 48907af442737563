//! Restore engine - one-shot reverse mirror from a target back into a source

use crate::config::Limits;
use crate::fsops;
use crate::paths;
use crate::types::MirrorError;
use filetime::FileTime;
use std::collections::HashSet;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Make `source_root` identical to `target_root`.
///
/// The target must exist; the source is created if missing. Two passes:
/// first every target entry is written into the source (files are skipped
/// when length and mtime already match, since mirra stamped those mtimes
/// itself), then source entries with no counterpart in the target are
/// removed. Symlink targets pointing into the target tree are rewritten to
/// point into the source tree.
///
/// Callers stop the session for `source_root` before invoking this; no
/// worker or watcher may be live for it.
pub async fn restore(
    source_root: &Path,
    target_root: &Path,
    limits: Limits,
    cancel: &CancellationToken,
) -> Result<(), MirrorError> {
    match fs::metadata(target_root).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) | Err(_) => {
            return Err(MirrorError::RestoreTargetMissing { path: target_root.to_path_buf() })
        }
    }
    fs::create_dir_all(source_root).await?;

    let mut present: HashSet<PathBuf> = HashSet::new();
    copy_pass(target_root, source_root, target_root, limits, &mut present, cancel).await?;
    prune_pass(source_root, source_root, &present, cancel).await?;
    Ok(())
}

/// DFS over the target, writing each entry into the source and recording
/// its relative path.
fn copy_pass<'a>(
    target_root: &'a Path,
    source_root: &'a Path,
    dir: &'a Path,
    limits: Limits,
    present: &'a mut HashSet<PathBuf>,
    cancel: &'a CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<(), MirrorError>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }

            let path = entry.path();
            let rel = match path.strip_prefix(target_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => {
                    warn!("skipping {} outside restore root", path.display());
                    continue;
                }
            };
            let dst = source_root.join(&rel);
            present.insert(rel);

            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                restore_symlink(&path, &dst, target_root, source_root).await?;
            } else if file_type.is_dir() {
                restore_dir(&dst).await?;
                copy_pass(target_root, source_root, &path, limits, present, cancel).await?;
            } else {
                restore_file(&path, &dst, limits.copy_buffer_bytes).await?;
            }
        }
        Ok(())
    })
}

async fn restore_symlink(
    entry: &Path,
    dst: &Path,
    target_root: &Path,
    source_root: &Path,
) -> std::io::Result<()> {
    let link = fs::read_link(entry).await?;
    let link_target = paths::rewrite_link_target(&link, target_root, source_root);
    let is_dir_link = fs::metadata(entry).await.map(|m| m.is_dir()).unwrap_or(false);
    fsops::remove_entry(dst).await?;
    fsops::make_symlink(dst, &link_target, is_dir_link).await
}

async fn restore_dir(dst: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(dst).await {
        Ok(metadata) if metadata.is_dir() => return Ok(()),
        Ok(_) => fsops::remove_entry(dst).await?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    fs::create_dir_all(dst).await
}

async fn restore_file(entry: &Path, dst: &Path, buffer_bytes: usize) -> std::io::Result<()> {
    let entry_meta = fs::metadata(entry).await?;
    match fs::symlink_metadata(dst).await {
        Ok(dst_meta) if dst_meta.is_file() => {
            let same_len = dst_meta.len() == entry_meta.len();
            let same_mtime = FileTime::from_last_modification_time(&dst_meta)
                == FileTime::from_system_time(entry_meta.modified()?);
            if same_len && same_mtime {
                return Ok(()); // unchanged since the mirror wrote it
            }
        }
        Ok(_) => fsops::remove_entry(dst).await?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    fsops::copy_file(entry, dst, buffer_bytes).await?;
    Ok(())
}

/// DFS over the source, deleting entries the copy pass did not record.
///
/// Symlinked directories are never descended into; a directory absent from
/// `present` is removed whole without recursing.
fn prune_pass<'a>(
    source_root: &'a Path,
    dir: &'a Path,
    present: &'a HashSet<PathBuf>,
    cancel: &'a CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<(), MirrorError>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }

            let path = entry.path();
            let rel = match path.strip_prefix(source_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };

            if !present.contains(&rel) {
                fsops::remove_entry(&path).await?;
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_dir() && !file_type.is_symlink() {
                prune_pass(source_root, &path, present, cancel).await?;
            }
        }
        Ok(())
    })
}
