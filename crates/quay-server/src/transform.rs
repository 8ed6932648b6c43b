//! Source transform collaborator.
//!
//! Transpilation (TypeScript/JSX, CSS module wrapping) happens outside this
//! crate; the dispatcher hands recognized source files to whatever
//! [`Transform`] the embedder supplies and serves the result verbatim.

use crate::error::HttpError;
use async_trait::async_trait;
use std::collections::HashSet;

/// Output of a source transform: rewritten text plus the MIME type to serve
/// it under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    /// Transformed source text
    pub code: String,
    /// Content type for the response
    pub mime: String,
}

/// Source-to-source transform service.
///
/// Implementations are opaque to the server; a failure is reported as a 500
/// to the requesting client and never crashes the request task.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Transform `source` (a file with extension `ext`, without the dot).
    async fn transform(&self, source: &str, ext: &str) -> Result<TransformOutput, HttpError>;
}

/// Extensions routed through the transform service when one is configured.
pub fn default_transform_extensions() -> HashSet<String> {
    ["ts", "tsx", "jsx", "mts"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_extensions() {
        let exts = default_transform_extensions();
        assert!(exts.contains("ts"));
        assert!(exts.contains("tsx"));
        assert!(exts.contains("jsx"));
        assert!(!exts.contains("css"));
        assert!(!exts.contains("js"));
    }
}
