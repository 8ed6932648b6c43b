//! MIME type lookup.
//!
//! The dispatcher treats content-type resolution as a pluggable collaborator
//! so embedders can extend the table. [`DefaultMimeTable`] covers the
//! extensions a dev server actually serves.

use std::path::Path;

/// Content-type lookup by file extension or path.
pub trait MimeTable: Send + Sync {
    /// Look up the MIME type for a path or bare extension.
    ///
    /// Returns `None` when the extension is unknown; the caller falls back
    /// to `application/octet-stream`.
    fn lookup(&self, extension_or_path: &str) -> Option<&'static str>;
}

/// Built-in extension table.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMimeTable;

impl MimeTable for DefaultMimeTable {
    fn lookup(&self, extension_or_path: &str) -> Option<&'static str> {
        let ext = if extension_or_path.contains('.') || extension_or_path.contains('/') {
            Path::new(extension_or_path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
        } else {
            extension_or_path
        };

        match ext {
            "html" | "htm" => Some("text/html; charset=utf-8"),
            "js" | "mjs" | "cjs" => Some("application/javascript; charset=utf-8"),
            "ts" | "tsx" | "jsx" | "mts" => Some("application/javascript; charset=utf-8"),
            "css" => Some("text/css; charset=utf-8"),
            "json" | "map" => Some("application/json"),
            "wasm" => Some("application/wasm"),
            "svg" => Some("image/svg+xml"),
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "gif" => Some("image/gif"),
            "webp" => Some("image/webp"),
            "ico" => Some("image/x-icon"),
            "woff" => Some("font/woff"),
            "woff2" => Some("font/woff2"),
            "ttf" => Some("font/ttf"),
            "otf" => Some("font/otf"),
            "txt" => Some("text/plain; charset=utf-8"),
            "xml" => Some("application/xml"),
            "pdf" => Some("application/pdf"),
            "mp4" => Some("video/mp4"),
            "webm" => Some("video/webm"),
            "mp3" => Some("audio/mpeg"),
            _ => None,
        }
    }
}

/// Look up a content type, defaulting to `application/octet-stream`.
pub fn content_type_for(table: &dyn MimeTable, path: &str) -> &'static str {
    table.lookup(path).unwrap_or("application/octet-stream")
}
