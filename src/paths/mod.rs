//! Path normalization, containment checks, and symlink-target rewriting

use path_clean::PathClean;
use std::path::{Path, PathBuf};

/// Normalize a path to an absolute lexical form.
///
/// Relative paths are resolved against the current working directory.
/// `.` components are dropped and `..` pops the previous component; no
/// filesystem access happens, so the path does not need to exist and
/// symlinks along the way are not resolved.
pub fn normalize(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(clean(&absolute))
}

/// Lexically clean an already-absolute path.
pub fn clean(path: &Path) -> PathBuf {
    path.clean()
}

/// True iff `candidate` equals `base` or lies underneath it.
///
/// Comparison is component-wise on normalized paths, so `/a/bc` is not a
/// subpath of `/a/b`.
pub fn is_subpath(candidate: &Path, base: &Path) -> bool {
    candidate.starts_with(base)
}

/// Rewrite an absolute symlink target from one tree into another.
///
/// Relative link targets are returned unchanged. Absolute targets are
/// lexically cleaned; if the result is `from_root` or lies under it, the
/// same relative location under `to_root` is returned. Targets pointing
/// outside `from_root` are preserved verbatim.
pub fn rewrite_link_target(link: &Path, from_root: &Path, to_root: &Path) -> PathBuf {
    if link.is_relative() {
        return link.to_path_buf();
    }

    let cleaned = clean(link);
    match cleaned.strip_prefix(from_root) {
        Ok(rel) if rel.as_os_str().is_empty() => to_root.to_path_buf(),
        Ok(rel) => to_root.join(rel),
        Err(_) => link.to_path_buf(),
    }
}
