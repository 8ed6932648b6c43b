//! Server-side rendering hook and post-processing pipeline.
//!
//! The render callback is supplied by the embedding application. Its output
//! is either a raw HTML string or a structural [`DomNode`] handed to the
//! [`DomSerializer`] collaborator. The pipeline wraps bare fragments in a
//! minimal document shell, rewrites relative asset references for the
//! mount's base path, optionally hoists `<style>` blocks, and injects the
//! import map and HMR bootstrap. A failure anywhere becomes a 500, never a
//! crash.

use crate::error::HttpError;
use crate::html;
use async_trait::async_trait;

/// A structural node produced by a render callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomNode {
    /// Tag name (`div`, `html`, ...)
    pub tag: String,
    /// Attribute pairs in emission order
    pub attrs: Vec<(String, String)>,
    /// Child nodes and text
    pub children: Vec<DomChild>,
}

/// Child of a [`DomNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomChild {
    Text(String),
    Node(DomNode),
}

impl DomNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    pub fn child(mut self, child: DomNode) -> Self {
        self.children.push(DomChild::Node(child));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(DomChild::Text(text.into()));
        self
    }
}

/// Output of a render callback.
pub enum RenderResult {
    /// Raw HTML, used as-is
    Html(String),
    /// Structural tree, serialized via the [`DomSerializer`]
    Node(DomNode),
}

/// Server-side render callback.
#[async_trait]
pub trait SsrHook: Send + Sync {
    async fn render(&self) -> Result<RenderResult, HttpError>;
}

/// Serializes a [`DomNode`] tree to HTML.
pub trait DomSerializer: Send + Sync {
    fn render_to_string(&self, node: &DomNode) -> Result<String, HttpError>;
}

/// Built-in serializer with standard text/attribute escaping.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDomSerializer;

impl DomSerializer for DefaultDomSerializer {
    fn render_to_string(&self, node: &DomNode) -> Result<String, HttpError> {
        let mut out = String::new();
        write_node(&mut out, node);
        Ok(out)
    }
}

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

fn write_node(out: &mut String, node: &DomNode) {
    out.push('<');
    out.push_str(&node.tag);
    for (name, value) in &node.attrs {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    out.push('>');

    if VOID_TAGS.contains(&node.tag.as_str()) {
        return;
    }

    for child in &node.children {
        match child {
            DomChild::Text(text) => out.push_str(&escape_text(text)),
            DomChild::Node(inner) => write_node(out, inner),
        }
    }

    out.push_str("</");
    out.push_str(&node.tag);
    out.push('>');
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Run the full SSR pipeline for a mount.
///
/// `has_static_shell` is true when the mount also has a physical index file;
/// styles emitted by the render are then hoisted into `<head>` instead of
/// being left inline.
pub async fn render_page(
    hook: &dyn SsrHook,
    serializer: &dyn DomSerializer,
    base_path: &str,
    has_static_shell: bool,
    import_map: Option<&str>,
) -> Result<String, HttpError> {
    let rendered = hook.render().await?;

    let mut page = match rendered {
        RenderResult::Html(raw) => ensure_document(&raw),
        RenderResult::Node(node) => {
            let serialized = serializer.render_to_string(&node)?;
            if node.tag.eq_ignore_ascii_case("html") {
                serialized
            } else {
                wrap_document(&serialized)
            }
        }
    };

    page = rewrite_relative_assets(&page, base_path);

    if has_static_shell {
        page = html::hoist_styles(&page);
    }

    if let Some(map) = import_map {
        page = html::inject_import_map(&page, map);
    }

    Ok(html::inject_hmr_script(&page))
}

/// Wrap a fragment unless it already is a full document.
fn ensure_document(raw: &str) -> String {
    let head = raw.trim_start().to_ascii_lowercase();
    if head.starts_with("<!doctype") || head.starts_with("<html") {
        raw.to_string()
    } else {
        wrap_document(raw)
    }
}

fn wrap_document(content: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n</head>\n<body>\n{}\n</body>\n</html>",
        content
    )
}

/// Prefix same-origin relative references (`src="./x"`, `href="./x"`) with
/// the mount's base path.
fn rewrite_relative_assets(page: &str, base_path: &str) -> String {
    page.replace("src=\"./", &format!("src=\"{}/", base_path))
        .replace("href=\"./", &format!("href=\"{}/", base_path))
}
