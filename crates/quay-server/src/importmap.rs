//! Import-map scanning and caching.
//!
//! The scanner itself is a collaborator (typically it walks `node_modules`
//! or a lockfile); this module owns an explicit per-server cache so the map
//! is computed once and invalidated deliberately, not via global state.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Produces a package-name -> URL map for `<script type="importmap">`.
pub trait ImportMapScanner: Send + Sync {
    /// Scan for importable packages. Errors are reported as a string; the
    /// caller logs and serves the page without a map.
    fn scan(&self) -> Result<HashMap<String, String>, String>;
}

/// Server-owned cache around a scanner.
pub struct ImportMapCache {
    scanner: Option<Arc<dyn ImportMapScanner>>,
    cached: RwLock<Option<String>>,
}

impl ImportMapCache {
    pub fn new(scanner: Option<Arc<dyn ImportMapScanner>>) -> Self {
        Self {
            scanner,
            cached: RwLock::new(None),
        }
    }

    /// The serialized import map, scanning on first use.
    ///
    /// Returns `None` when no scanner is configured, the scan failed, or
    /// the scan produced an empty map.
    pub fn get(&self) -> Option<String> {
        if let Some(json) = self.cached.read().clone() {
            return Some(json);
        }

        let scanner = self.scanner.as_ref()?;
        let imports = match scanner.scan() {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(error = %err, "import-map scan failed");
                return None;
            }
        };
        if imports.is_empty() {
            return None;
        }

        let json = serde_json::json!({ "imports": imports }).to_string();
        *self.cached.write() = Some(json.clone());
        Some(json)
    }

    /// Drop the cached map; the next `get` rescans.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}
