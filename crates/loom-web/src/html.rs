//! HTML fragments shared by the pages.

use chrono::DateTime;

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Percent-encode an id or path segment for use in a URL path.
pub fn url_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'@' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Path of `/{id}/{rest}` with `id` encoded.
pub fn href(id: &str, rest: &str) -> String {
    if rest.is_empty() {
        format!("/{}", url_segment(id))
    } else {
        format!("/{}/{}", url_segment(id), rest)
    }
}

pub fn link(href: &str, text: &str) -> String {
    format!(r#"<a href="{}">{}</a>"#, html_escape(href), html_escape(text))
}

/// UTC date of a millisecond timestamp.
pub fn format_date(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// Scoped error shown in place of the content that failed.
pub fn error_section(message: &str) -> String {
    format!(
        r#"<section class="error"><strong>Error</strong> <pre>{}</pre></section>"#,
        html_escape(message)
    )
}

/// Inline marker for one item that could not be fully rendered.
pub fn item_error(message: &str) -> String {
    format!(r#"<span class="item-error" title="{}">⚠</span>"#, html_escape(message))
}

/// Wrap `body` in the page skeleton.
pub fn layout(lang: &str, title: &str, body: &str) -> String {
    PAGE_HTML
        .replace("<!-- LANG -->", &html_escape(lang))
        .replace("<!-- TITLE -->", &html_escape(title))
        .replace("<!-- BODY -->", body)
}

const PAGE_HTML: &str = r#"<!DOCTYPE html>
<html lang="<!-- LANG -->">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title><!-- TITLE --> - loom</title>
    <link rel="stylesheet" href="/static/styles.css">
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif; max-width: 960px; margin: 0 auto; padding: 2rem; }
        nav a { margin-right: 1rem; }
        .feed-item { padding: 0.5rem 0; border-bottom: 1px solid #ddd; }
        .date { color: #888; font-size: 0.85rem; }
        .paginate { margin: 1rem 0; }
        .error { background: #fee; border: 1px solid #c66; padding: 0.5rem 1rem; }
        .item-error { color: #c33; }
        table.diff { border-collapse: collapse; font-family: monospace; width: 100%; }
        table.diff td { padding: 0 0.5rem; white-space: pre; }
        tr.added { background: #dfd; }
        tr.removed { background: #fdd; }
        td.line-num { color: #999; text-align: right; }
    </style>
</head>
<body>
    <header><a href="/">loom</a></header>
    <main><!-- BODY --></main>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_and_segments() {
        assert_eq!(html_escape(r#"<a href="x">&</a>"#), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
        assert_eq!(url_segment("%abc+/def=.sha256"), "%25abc%2B%2Fdef%3D.sha256");
        assert_eq!(href("@me.ed25519", "repos"), "/@me.ed25519/repos");
    }

    #[test]
    fn test_format_date() {
        assert_eq!(format_date(0), "1970-01-01 00:00");
        assert_eq!(format_date(1_500_000_000_000), "2017-07-14 02:40");
    }

    #[test]
    fn test_layout_escapes_title() {
        let page = layout("de", "<repo>", "<p>body</p>");
        assert!(page.contains(r#"<html lang="de">"#));
        assert!(page.contains("&lt;repo&gt; - loom"));
        assert!(page.contains("<p>body</p>"));
    }
}
