//! Filesystem primitives shared by the apply loop and the restore engine

use filetime::FileTime;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Copy `src` to `dest` byte-for-byte and stamp `dest` with the source's
/// last-modification time.
///
/// The destination's parent must already exist. Returns the number of
/// bytes copied.
pub async fn copy_file(src: &Path, dest: &Path, buffer_bytes: usize) -> std::io::Result<u64> {
    let mut src_file = File::open(src).await?;
    let mut dest_file = File::create(dest).await?;

    let mut buffer = vec![0u8; buffer_bytes.max(1)];
    let mut total_bytes = 0u64;

    loop {
        let bytes_read = src_file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break; // EOF
        }
        dest_file.write_all(&buffer[0..bytes_read]).await?;
        total_bytes += bytes_read as u64;
    }

    dest_file.flush().await?;
    drop(dest_file);

    let src_metadata = fs::metadata(src).await?;
    stamp_mtime(dest, src_metadata.modified()?)?;

    Ok(total_bytes)
}

/// Set a file's last-modification time.
pub fn stamp_mtime(path: &Path, mtime: SystemTime) -> std::io::Result<()> {
    filetime::set_file_mtime(path, FileTime::from_system_time(mtime))
}

/// Remove whatever is at `path`: unlink files and symlinks, recursively
/// remove directories. A missing entry is not an error, which keeps
/// repeated or out-of-order delete notifications idempotent.
pub async fn remove_entry(path: &Path) -> std::io::Result<()> {
    let result = match fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(err) => return ignore_missing(err),
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) => ignore_missing(err),
    }
}

/// Create a symlink at `link` pointing at `target` verbatim.
#[cfg(unix)]
pub async fn make_symlink(link: &Path, target: &Path, _is_dir_link: bool) -> std::io::Result<()> {
    fs::symlink(target, link).await
}

/// Create a symlink at `link` pointing at `target` verbatim.
///
/// Windows distinguishes file and directory symlinks at creation time.
#[cfg(windows)]
pub async fn make_symlink(link: &Path, target: &Path, is_dir_link: bool) -> std::io::Result<()> {
    if is_dir_link {
        fs::symlink_dir(target, link).await
    } else {
        fs::symlink_file(target, link).await
    }
}

fn ignore_missing(err: std::io::Error) -> std::io::Result<()> {
    if err.kind() == ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err)
    }
}
