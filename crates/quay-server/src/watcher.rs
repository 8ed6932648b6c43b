//! File system watcher feeding the HMR hub.
//!
//! Watches every mount root (plus any extra configured roots) recursively,
//! debounces rapid successive events per path, and filters out build
//! artifacts, dependency directories and hidden files. Only the normalized
//! event stream leaves this module; the hub decides what each event means
//! for connected clients.

use crate::error::{Result, ServerError};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A normalized change event. Paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// File was created
    Added(PathBuf),
    /// File contents changed
    Changed(PathBuf),
    /// File was removed
    Removed(PathBuf),
}

impl WatchEvent {
    /// The path affected by this event.
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Added(p) | WatchEvent::Changed(p) | WatchEvent::Removed(p) => p,
        }
    }
}

/// Debounced, filtered recursive watcher over a set of roots.
pub struct FileWatcher {
    // notify stops delivering when the watcher is dropped; hold it.
    _watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl FileWatcher {
    /// Watch `roots` recursively.
    ///
    /// Returns the watcher (keep it alive) and the receiving end of the
    /// event stream. Roots must exist.
    pub fn new(
        roots: Vec<PathBuf>,
        ignore_patterns: Vec<String>,
        debounce_ms: u64,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>)> {
        for root in &roots {
            if !root.exists() {
                return Err(ServerError::PathNotFound(root.clone()));
            }
        }

        let (tx, rx) = mpsc::channel(256);

        let debounce = Duration::from_millis(debounce_ms);
        let mut last_event: Option<(PathBuf, Instant)> = None;
        let roots_for_filter = roots.clone();
        let patterns = ignore_patterns;

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "file watcher error");
                    return;
                }
            };

            for path in &event.paths {
                if should_ignore(path, &roots_for_filter, &patterns) {
                    continue;
                }

                let now = Instant::now();
                if let Some((last_path, last_time)) = &last_event {
                    if last_path == path && now.duration_since(*last_time) < debounce {
                        continue;
                    }
                }
                last_event = Some((path.clone(), now));

                let change = match event.kind {
                    notify::EventKind::Create(_) => WatchEvent::Added(path.clone()),
                    notify::EventKind::Modify(_) => WatchEvent::Changed(path.clone()),
                    notify::EventKind::Remove(_) => WatchEvent::Removed(path.clone()),
                    _ => continue,
                };

                // The callback runs on notify's thread; blocking_send is
                // the supported bridge into tokio.
                let _ = tx.blocking_send(change);
            }
        })
        .map_err(ServerError::Watch)?;

        for root in &roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(ServerError::Watch)?;
        }

        Ok((
            Self {
                _watcher: watcher,
                roots,
            },
            rx,
        ))
    }

    /// The watched roots.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// Filter for watcher events: paths outside every root, matches against
/// the ignore patterns, and hidden files are dropped.
fn should_ignore(path: &Path, roots: &[PathBuf], ignore_patterns: &[String]) -> bool {
    let Some(rel_path) = roots.iter().find_map(|root| path.strip_prefix(root).ok()) else {
        return true;
    };

    let path_str = rel_path.to_string_lossy();

    for pattern in ignore_patterns {
        if let Some(ext) = pattern.strip_prefix('*') {
            if path_str.ends_with(ext) {
                return true;
            }
        } else if path_str.starts_with(pattern.as_str())
            || path_str.contains(&format!("/{}", pattern))
        {
            return true;
        }
    }

    for component in rel_path.components() {
        if let Some(name) = component.as_os_str().to_str() {
            if name.starts_with('.') && name != "." && name != ".." {
                return true;
            }
        }
    }

    false
}
