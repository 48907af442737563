//! Apply loop - drains a worker's queue against its target tree

use crate::fsops;
use crate::types::ChangeEvent;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, Semaphore};
use tracing::{trace, warn};

pub(crate) struct ApplyContext {
    pub target_root: PathBuf,
    pub copy_limiter: Arc<Semaphore>,
    pub copy_buffer_bytes: usize,
}

/// Drain the queue until it is closed and empty.
///
/// An I/O failure on one event is logged and the loop moves on; queue
/// closure is the only termination signal.
pub(crate) async fn run(context: ApplyContext, mut rx: mpsc::Receiver<ChangeEvent>) {
    while let Some(event) = rx.recv().await {
        trace!(target = %context.target_root.display(), ?event, "applying event");
        if let Err(err) = apply_event(&context, &event).await {
            warn!(
                "failed to apply {} under {}: {}",
                event.rel().display(),
                context.target_root.display(),
                err
            );
        }
    }
}

async fn apply_event(context: &ApplyContext, event: &ChangeEvent) -> std::io::Result<()> {
    match event {
        ChangeEvent::EnsureDir { rel } => ensure_dir(context, rel).await,
        ChangeEvent::CopyFile { rel, source } => copy_file(context, rel, source).await,
        ChangeEvent::DeleteFile { rel } | ChangeEvent::DeleteDir { rel } => {
            fsops::remove_entry(&context.target_root.join(rel)).await
        }
        ChangeEvent::CreateSymlink { rel, link_target, is_dir_link } => {
            create_symlink(context, rel, link_target, *is_dir_link).await
        }
    }
}

async fn ensure_dir(context: &ApplyContext, rel: &Path) -> std::io::Result<()> {
    let dest = context.target_root.join(rel);
    match fs::symlink_metadata(&dest).await {
        Ok(metadata) if metadata.is_dir() => return Ok(()),
        Ok(_) => fsops::remove_entry(&dest).await?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    fs::create_dir_all(&dest).await
}

async fn copy_file(context: &ApplyContext, rel: &Path, source: &Path) -> std::io::Result<()> {
    let dest = context.target_root.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    fsops::remove_entry(&dest).await?;

    // Permit is held for the duration of the copy and released on every
    // exit path when the guard drops.
    let _permit = context
        .copy_limiter
        .acquire()
        .await
        .map_err(|_| std::io::Error::other("copy limiter closed"))?;
    fsops::copy_file(source, &dest, context.copy_buffer_bytes).await?;
    Ok(())
}

async fn create_symlink(
    context: &ApplyContext,
    rel: &Path,
    link_target: &Path,
    is_dir_link: bool,
) -> std::io::Result<()> {
    let dest = context.target_root.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    fsops::remove_entry(&dest).await?;
    fsops::make_symlink(&dest, link_target, is_dir_link).await
}
