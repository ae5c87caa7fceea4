//! Working-tree mirroring into the ephemeral task directory.

use std::fs;
use std::path::Component;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Entries never copied into a mirror unless the mirror-everything override
/// is set: version control metadata, credential/environment files, and
/// dependency caches.
const EXCLUDED_DIRS: &[&str] = &[".git", ".hg", ".svn", ".venv", "node_modules", "target"];
const EXCLUDED_FILES: &[&str] = &[".netrc", ".npmrc"];
const EXCLUDED_FILE_PREFIXES: &[&str] = &[".env"];

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror source {0} escapes the base working directory")]
    OutsideBase(String),
    #[error("mirror source {0} does not exist")]
    MissingSource(String),
    #[error("failed to mirror {path}: {source}")]
    Copy {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn is_excluded_dir(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name)
}

fn is_excluded_file(name: &str) -> bool {
    EXCLUDED_FILES.contains(&name) || EXCLUDED_FILE_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Lexically normalizes `path` (no symlink resolution) so `..` segments
/// cannot sneak a source outside the base.
fn normalize(path: &Path) -> std::path::PathBuf {
    let mut out = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Copies the tree at `src` into `dest`.
///
/// `src` must resolve inside `base`; sensitive entries are skipped unless
/// `mirror_everything` is set (a trusted operator-only override).
pub fn mirror_tree(
    src: &Path,
    dest: &Path,
    base: &Path,
    mirror_everything: bool,
) -> Result<(), MirrorError> {
    let src_abs = if src.is_absolute() {
        normalize(src)
    } else {
        normalize(&base.join(src))
    };
    let base_abs = normalize(base);
    if !src_abs.starts_with(&base_abs) {
        return Err(MirrorError::OutsideBase(src.display().to_string()));
    }
    if !src_abs.exists() {
        return Err(MirrorError::MissingSource(src.display().to_string()));
    }

    let mut walker = WalkDir::new(&src_abs).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| MirrorError::Copy {
            path: src_abs.display().to_string(),
            source: e.into(),
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = entry
            .path()
            .strip_prefix(&src_abs)
            .unwrap_or_else(|_| Path::new(""));
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            if !mirror_everything && entry.depth() > 0 && is_excluded_dir(&name) {
                debug!(dir = %entry.path().display(), "skipping excluded directory");
                walker.skip_current_dir();
                continue;
            }
            fs::create_dir_all(&target).map_err(|source| MirrorError::Copy {
                path: target.display().to_string(),
                source,
            })?;
        } else if entry.file_type().is_file() {
            if !mirror_everything && is_excluded_file(&name) {
                debug!(file = %entry.path().display(), "skipping excluded file");
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| MirrorError::Copy {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
            fs::copy(entry.path(), &target).map_err(|source| MirrorError::Copy {
                path: entry.path().display().to_string(),
                source,
            })?;
        }
        // Symlinks are not followed and not recreated.
    }
    Ok(())
}
