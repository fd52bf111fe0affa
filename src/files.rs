//! Static file serving under a path prefix.
//!
//! Request paths are percent-decoded and normalized segment by segment
//! before touching the filesystem; any path that would escape the configured
//! root is rejected with a 400. Directories serve their `index.html` when
//! present, or an HTML listing when enabled.

use std::path::Path;

use tracing::{debug, error};

use crate::config::FilesConfig;
use crate::http::Response;
use crate::respond;

pub(crate) async fn handle(config: &FilesConfig, request_path: &str) -> Response {
    let relative = request_path
        .strip_prefix(&config.path)
        .unwrap_or(request_path);

    let decoded = match percent_decode(relative) {
        Some(decoded) => decoded,
        None => {
            debug!(path = %request_path, "malformed percent-encoding in file path");
            return respond::bad_request(request_path);
        }
    };

    let segments = match normalize_segments(&decoded) {
        Some(segments) => segments,
        None => {
            debug!(path = %request_path, "file path escapes serving root");
            return respond::bad_request(request_path);
        }
    };

    let mut fs_path = config.root_dir.clone();
    for segment in &segments {
        fs_path.push(segment);
    }

    match tokio::fs::metadata(&fs_path).await {
        Ok(meta) if meta.is_dir() => serve_dir(config, request_path, &fs_path).await,
        Ok(_) => serve_file(request_path, &fs_path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => respond::not_found(request_path),
        Err(e) => {
            error!(path = %request_path, error = %e, "failed to stat file");
            respond::server_error()
        }
    }
}

async fn serve_file(request_path: &str, fs_path: &Path) -> Response {
    match tokio::fs::read(fs_path).await {
        Ok(data) => Response::ok()
            .header("Content-Type", media_type(fs_path))
            .body_bytes(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => respond::not_found(request_path),
        Err(e) => {
            error!(path = %request_path, error = %e, "failed to read file");
            respond::server_error()
        }
    }
}

async fn serve_dir(config: &FilesConfig, request_path: &str, fs_path: &Path) -> Response {
    // a directory with an index.html serves that instead of a listing
    let index = fs_path.join("index.html");
    match tokio::fs::metadata(&index).await {
        Ok(meta) if meta.is_file() => return serve_file(request_path, &index).await,
        Ok(_) | Err(_) => {}
    }

    if !config.dir_listing {
        return respond::not_found(request_path);
    }

    match render_listing(request_path, fs_path, config).await {
        Ok(html) => Response::ok()
            .header("Content-Type", "text/html; charset=utf-8")
            .body(html),
        Err(e) => {
            error!(path = %request_path, error = %e, "failed to list directory");
            respond::server_error()
        }
    }
}

struct Entry {
    name: String,
    is_dir: bool,
    size: u64,
}

async fn render_listing(
    request_path: &str,
    fs_path: &Path,
    config: &FilesConfig,
) -> std::io::Result<String> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(fs_path).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let meta = entry.metadata().await?;
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }

    // directories first, then case-insensitive by name
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    let base = if request_path.ends_with('/') {
        request_path.to_owned()
    } else {
        format!("{request_path}/")
    };

    let title = escape_html(request_path);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {title}</title></head>\n\
         <body>\n<h1>Index of {title}</h1>\n<ul>\n"
    );

    if base.trim_end_matches('/') != config.path.trim_end_matches('/') {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }

    for entry in &entries {
        let name = escape_html(&entry.name);
        if entry.is_dir {
            html.push_str(&format!(
                "<li><a href=\"{base}{name}/\">{name}/</a></li>\n"
            ));
        } else {
            html.push_str(&format!(
                "<li><a href=\"{base}{name}\">{name}</a> ({})</li>\n",
                human_size(entry.size)
            ));
        }
    }

    html.push_str("</ul>\n</body>\n</html>\n");
    Ok(html)
}

/// Decodes `%XX` escapes. Returns `None` on truncated or non-hex escapes and
/// on byte sequences that are not valid UTF-8.
fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let high = (hex[0] as char).to_digit(16)?;
            let low = (hex[1] as char).to_digit(16)?;
            out.push((high * 16 + low) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Resolves `.` and `..` segments. Returns `None` when the path would climb
/// above its root.
fn normalize_segments(path: &str) -> Option<Vec<String>> {
    let mut segments: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return None;
                }
            }
            other => segments.push(other.to_owned()),
        }
    }
    Some(segments)
}

fn media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "md" => "text/markdown; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "pdf" => "application/pdf",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

/// Formats a byte count the way directory listings show it: two decimals and
/// a single-letter suffix, base 1024.
fn human_size(len: u64) -> String {
    const SUFFIXES: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut base: u64 = 1;
    let mut index = 0;
    while index + 1 < SUFFIXES.len() && base * 1024 < len {
        base *= 1024;
        index += 1;
    }
    format!("{:.2}{}", len as f64 / base as f64, SUFFIXES[index])
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decode_plain() {
        assert_eq!(percent_decode("/a/b.txt").as_deref(), Some("/a/b.txt"));
    }

    #[test]
    fn percent_decode_escapes() {
        assert_eq!(
            percent_decode("/hello%20world%2F..").as_deref(),
            Some("/hello world/..")
        );
    }

    #[test]
    fn percent_decode_rejects_truncated() {
        assert!(percent_decode("/a%2").is_none());
        assert!(percent_decode("/a%").is_none());
    }

    #[test]
    fn percent_decode_rejects_non_hex() {
        assert!(percent_decode("/a%zz").is_none());
    }

    #[test]
    fn normalize_resolves_dot_segments() {
        assert_eq!(
            normalize_segments("/a/./b/../c").unwrap(),
            vec!["a".to_owned(), "c".to_owned()]
        );
    }

    #[test]
    fn normalize_rejects_root_escape() {
        assert!(normalize_segments("/../etc/passwd").is_none());
        assert!(normalize_segments("/a/../../b").is_none());
    }

    #[test]
    fn normalize_allows_balanced_traversal() {
        assert_eq!(
            normalize_segments("/a/b/../c").unwrap(),
            vec!["a".to_owned(), "c".to_owned()]
        );
    }

    #[test]
    fn media_type_by_extension() {
        assert_eq!(media_type(Path::new("x.html")), "text/html; charset=utf-8");
        assert_eq!(media_type(Path::new("x.PNG")), "image/png");
        assert_eq!(media_type(Path::new("x.unknown")), "application/octet-stream");
        assert_eq!(media_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(512), "512.00B");
        assert_eq!(human_size(2048), "2.00K");
        assert_eq!(human_size(3 * 1024 * 1024), "3.00M");
    }
}
