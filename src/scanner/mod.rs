//! Source scanner - seeds a worker's queue from a recursive walk

use crate::paths;
use crate::types::{ChangeEvent, MirrorError};
use crate::worker::TargetWorker;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Walk `root` depth-first and push the events that make the worker's
/// target identical to it.
///
/// Emission order per entry: symlinks are pushed as `CreateSymlink` (with
/// the link target rewritten into the worker's target tree) and never
/// descended into; directories are pushed as `EnsureDir` before their
/// children; regular files become `CopyFile`. Directory enumeration order
/// is whatever the filesystem yields - parents always precede children,
/// which is the only order the apply side needs.
pub async fn scan(
    root: &Path,
    worker: &TargetWorker,
    cancel: &CancellationToken,
) -> Result<(), MirrorError> {
    scan_dir(root, root, worker, cancel).await
}

/// Same walk rooted at a subtree of `root`.
///
/// Emitted relative paths stay relative to `root`; used by the watcher to
/// pick up children that arrive silently with a directory rename.
pub async fn scan_subtree(
    root: &Path,
    subtree: &Path,
    worker: &TargetWorker,
    cancel: &CancellationToken,
) -> Result<(), MirrorError> {
    scan_dir(root, subtree, worker, cancel).await
}

fn scan_dir<'a>(
    root: &'a Path,
    dir: &'a Path,
    worker: &'a TargetWorker,
    cancel: &'a CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<(), MirrorError>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }

            let path = entry.path();
            let rel = match path.strip_prefix(root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => {
                    warn!("skipping {} outside scan root {}", path.display(), root.display());
                    continue;
                }
            };

            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                let link = fs::read_link(&path).await?;
                let link_target = paths::rewrite_link_target(
                    &link,
                    worker.source_root(),
                    worker.target_root(),
                );
                // Broken links stat as errors; treat those as file links.
                let is_dir_link = fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false);
                worker
                    .push(ChangeEvent::CreateSymlink { rel, link_target, is_dir_link })
                    .await?;
            } else if file_type.is_dir() {
                worker.push(ChangeEvent::EnsureDir { rel }).await?;
                scan_dir(root, &path, worker, cancel).await?;
            } else {
                worker.push(ChangeEvent::CopyFile { rel, source: path }).await?;
            }
        }
        Ok(())
    })
}
