//! Secure static-file resolution.
//!
//! Maps a mount-relative request path to a validated real filesystem path.
//! Every gate is ordered so that hostile paths (NUL bytes, `..` segments,
//! symlink escapes) are rejected before the filesystem is touched, and the
//! boundary is re-checked after symlinks are resolved.
//!
//! "Reserved" paths (`/dist/`, `/node_modules/`) resolve against the nearest
//! ancestor of the mount root that owns such a directory, and are exempt
//! from the post-symlink boundary check: linked packages legitimately point
//! outside the mount.

use crate::config::ResolvedMount;
use crate::error::HttpError;
use path_clean::PathClean;
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};

/// Upward levels searched for a reserved directory ancestor.
const MAX_ANCESTOR_WALK: usize = 5;

/// A successfully resolved file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Real (symlink-resolved) path on disk
    pub path: PathBuf,
    /// True when the path used a reserved base or traversed a symlink;
    /// callers use this as a transform/caching hint
    pub reserved_or_symlinked: bool,
}

/// Outcome of resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Serve this file.
    File(ResolvedFile),
    /// Nothing on disk, but the mount's SSR hook covers this request.
    SsrFallback,
}

/// Resolve a mount-relative URL path to a file.
///
/// `raw_path` is the percent-encoded path portion of the URL (query string
/// allowed and ignored). See the module docs for the gate order.
pub async fn resolve(mount: &ResolvedMount, raw_path: &str) -> Result<Resolution, HttpError> {
    let decoded = decode_path(raw_path)?;
    let path = strip_query(&decoded);

    let reserved = reserved_dir(path);

    // `..` is rejected on the decoded, unresolved path, before any
    // filesystem access. Reserved paths are still boundary-checked below.
    if reserved.is_none() {
        reject_parent_segments(path)?;
    }

    let base = match reserved {
        Some(name) => find_reserved_base(&mount.root, name).await,
        None => mount.root.clone(),
    };

    let candidate = base.join(path.trim_start_matches('/')).clean();
    if !candidate.starts_with(&base) {
        return Err(HttpError::Forbidden(format!(
            "path escapes its base directory: {}",
            path
        )));
    }

    let found = match locate(&candidate).await {
        Located::Found(p) => p,
        Located::DirWithoutIndex | Located::Missing
            if mount.ssr.is_some() && covers_index(mount, path) =>
        {
            return Ok(Resolution::SsrFallback);
        }
        Located::DirWithoutIndex if mount.ssr.is_some() => {
            return Ok(Resolution::SsrFallback);
        }
        _ => {
            return Err(HttpError::NotFound(format!("no file for {}", path)));
        }
    };

    let real = tokio::fs::canonicalize(&found).await.map_err(HttpError::from)?;

    if reserved.is_none() && !real.starts_with(&base) {
        return Err(HttpError::Forbidden(format!(
            "symlink target escapes mount root: {}",
            path
        )));
    }

    Ok(Resolution::File(ResolvedFile {
        reserved_or_symlinked: reserved.is_some() || real != found,
        path: real,
    }))
}

/// Percent-decode the request path. NUL bytes are forbidden outright;
/// undecodable sequences are a client error.
fn decode_path(raw: &str) -> Result<String, HttpError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| HttpError::BadRequest("request path is not valid UTF-8".into()))?;
    if decoded.contains('\0') {
        return Err(HttpError::Forbidden("NUL byte in request path".into()));
    }
    Ok(decoded.into_owned())
}

fn strip_query(path: &str) -> &str {
    match path.find('?') {
        Some(idx) => &path[..idx],
        None => path,
    }
}

/// Reserved directory name for the path, if it has a reserved prefix.
fn reserved_dir(path: &str) -> Option<&'static str> {
    if path.starts_with("/dist/") {
        Some("dist")
    } else if path.starts_with("/node_modules/") {
        Some("node_modules")
    } else {
        None
    }
}

fn reject_parent_segments(path: &str) -> Result<(), HttpError> {
    if path.split('/').any(|segment| segment == "..") {
        return Err(HttpError::Forbidden(format!(
            "parent traversal in request path: {}",
            path
        )));
    }
    Ok(())
}

/// Walk upward from the mount root looking for an ancestor that contains a
/// directory named `name`. Falls back to the mount root after
/// [`MAX_ANCESTOR_WALK`] levels.
async fn find_reserved_base(root: &Path, name: &str) -> PathBuf {
    let mut dir = root.to_path_buf();
    for _ in 0..=MAX_ANCESTOR_WALK {
        if is_dir(&dir.join(name)).await {
            return dir;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
    root.to_path_buf()
}

enum Located {
    Found(PathBuf),
    DirWithoutIndex,
    Missing,
}

/// Find the file for a lexical candidate, applying the extension retry
/// ladder: `.js` requests fall back to `.ts`; extensionless requests try
/// `.ts`, `.js`, then `index.ts`/`index.js` inside a matching directory;
/// a resolved directory is retried against its own index files.
async fn locate(candidate: &Path) -> Located {
    let mut candidates: Vec<PathBuf> = vec![candidate.to_path_buf()];

    match candidate.extension().and_then(|e| e.to_str()) {
        Some("js") => candidates.push(candidate.with_extension("ts")),
        Some(_) => {}
        None => {
            candidates.push(candidate.with_extension("ts"));
            candidates.push(candidate.with_extension("js"));
            candidates.push(candidate.join("index.ts"));
            candidates.push(candidate.join("index.js"));
        }
    }

    for cand in candidates {
        let Ok(meta) = tokio::fs::metadata(&cand).await else {
            continue;
        };
        if meta.is_dir() {
            for index in ["index.ts", "index.js"] {
                let inner = cand.join(index);
                if is_file(&inner).await {
                    return Located::Found(inner);
                }
            }
            return Located::DirWithoutIndex;
        }
        return Located::Found(cand);
    }

    Located::Missing
}

/// Is this request for the mount's configured index file?
fn covers_index(mount: &ResolvedMount, path: &str) -> bool {
    path == format!("/{}", mount.index_file)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}
