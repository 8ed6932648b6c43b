//! HTML post-processing helpers.
//!
//! Shared by the static path (served `.html` files) and the SSR pipeline:
//! inject the HMR bootstrap script before `</body>`, the import map before
//! `</head>`, and hoist inline `<style>` blocks into `<head>`. Injection
//! appends at the end when the anchor tag is absent.

/// URL of the HMR bootstrap script the hub serves.
pub const HMR_CLIENT_PATH: &str = "/__quay_hmr__.js";

/// URL of the WebSocket endpoint for the hub.
pub const HMR_WS_PATH: &str = "/__quay_hmr__";

/// Script tag loading the HMR bootstrap.
pub fn hmr_script_tag() -> String {
    format!(r#"<script src="{}"></script>"#, HMR_CLIENT_PATH)
}

/// Insert `fragment` immediately before the last occurrence of `anchor`,
/// or append it when the anchor is missing.
pub fn inject_before(html: &str, anchor: &str, fragment: &str) -> String {
    if let Some(pos) = html.rfind(anchor) {
        let mut result = String::with_capacity(html.len() + fragment.len() + 2);
        result.push_str(&html[..pos]);
        result.push_str(fragment);
        result.push('\n');
        result.push_str(&html[pos..]);
        return result;
    }

    let mut result = html.to_string();
    result.push('\n');
    result.push_str(fragment);
    result
}

/// Inject the HMR bootstrap script before `</body>`.
pub fn inject_hmr_script(html: &str) -> String {
    inject_before(html, "</body>", &hmr_script_tag())
}

/// Inject an import map before `</head>`.
pub fn inject_import_map(html: &str, import_map_json: &str) -> String {
    let tag = format!(
        r#"<script type="importmap">{}</script>"#,
        import_map_json
    );
    inject_before(html, "</head>", &tag)
}

/// Pull `<style>...</style>` blocks out of `html`.
///
/// Returns the document without the blocks plus the blocks themselves; used
/// to hoist SSR-emitted styles into the head of a static shell.
pub fn extract_style_blocks(html: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(html.len());
    let mut styles = Vec::new();
    let mut rest = html;

    loop {
        let lower = rest.to_ascii_lowercase();
        let Some(start) = lower.find("<style") else {
            out.push_str(rest);
            break;
        };
        let Some(end) = lower[start..].find("</style>") else {
            out.push_str(rest);
            break;
        };
        let end = start + end + "</style>".len();

        out.push_str(&rest[..start]);
        styles.push(rest[start..end].to_string());
        rest = &rest[end..];
    }

    (out, styles)
}

/// Hoist extracted style blocks into `<head>` (before `</head>`).
pub fn hoist_styles(html: &str) -> String {
    let (stripped, styles) = extract_style_blocks(html);
    if styles.is_empty() {
        return html.to_string();
    }
    inject_before(&stripped, "</head>", &styles.join("\n"))
}
