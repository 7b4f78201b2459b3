//! `web.fetch`: GET-only HTTP fetch with a manual, re-validated redirect loop.
//!
//! Grounded in `coworker/tools/web_tools.py`. Unlike `reqwest`'s built-in
//! redirect handling, each hop here is re-checked against the scheme and host
//! allow-list before the next request goes out — a redirect to an
//! off-allowlist host, or to a non-http(s) scheme, must fail the same way a
//! direct request to it would.

use std::time::Duration;

use std::sync::LazyLock;

use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use url::Url;

use crate::error::ToolError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_REDIRECTS: u8 = 5;

const REDIRECT_STATUSES: &[StatusCode] = &[
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

pub struct FetchResult {
    pub text: String,
    pub content_type: String,
}

/// Fetch `url`, following same-allowlist redirects up to `DEFAULT_MAX_REDIRECTS`
/// hops, reading at most `max_bytes` of body.
pub async fn fetch_url(url: &str, max_bytes: u64, allowlist: &[String]) -> Result<FetchResult, ToolError> {
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(|e| ToolError::Http(e.to_string()))?;

    let mut current = Url::parse(url).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
    check_allowlisted(&current, allowlist)?;

    for _ in 0..=DEFAULT_MAX_REDIRECTS {
        let response = client
            .request(Method::GET, current.clone())
            .send()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;

        let status = response.status();
        if REDIRECT_STATUSES.contains(&status) {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ToolError::Http(format!("redirect {status} missing Location")))?;
            let next = current
                .join(location)
                .map_err(|e| ToolError::Http(format!("invalid redirect location: {e}")))?;
            check_allowlisted(&next, allowlist)?;
            current = next;
            continue;
        }

        if !status.is_success() {
            return Err(ToolError::Http(format!("unexpected status {status}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = read_capped(response, max_bytes).await?;
        let text = decode_body(&bytes, &content_type);
        let text = if looks_like_html(&content_type, &text) {
            sanitize_html(&text)
        } else {
            text
        };
        return Ok(FetchResult { text, content_type });
    }

    Err(ToolError::Http(format!(
        "exceeded redirect limit ({DEFAULT_MAX_REDIRECTS} hops)"
    )))
}

fn check_allowlisted(url: &Url, allowlist: &[String]) -> Result<(), ToolError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ToolError::OutOfPolicy(format!("url scheme '{}' must be http or https", url.scheme())));
    }

    let host = url.host_str().unwrap_or("").to_lowercase();
    let allowed = allowlist.iter().any(|entry| {
        let entry = entry.to_lowercase();
        host == entry || host.ends_with(&format!(".{entry}"))
    });
    if allowed {
        Ok(())
    } else {
        Err(ToolError::OutOfPolicy(format!("host '{host}' is not allow-listed")))
    }
}

async fn read_capped(response: reqwest::Response, max_bytes: u64) -> Result<Vec<u8>, ToolError> {
    use futures_util::StreamExt;

    let cap = max_bytes + 1;
    let mut buf = Vec::with_capacity(cap.min(1 << 20) as usize);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ToolError::Http(e.to_string()))?;
        buf.extend_from_slice(&chunk);
        if buf.len() as u64 >= cap {
            break;
        }
    }
    buf.truncate(max_bytes as usize);
    Ok(buf)
}

/// Decodes the body as UTF-8; any other declared charset falls back to a
/// lossy UTF-8 decode with a warning rather than a real transcode.
fn decode_body(bytes: &[u8], content_type: &str) -> String {
    let charset = content_type
        .split(';')
        .find_map(|part| part.trim().strip_prefix("charset="))
        .map(str::trim);
    match charset {
        Some(charset) if !charset.eq_ignore_ascii_case("utf-8") => {
            tracing::warn!(charset = %charset, "charset not fully supported, using UTF-8 fallback");
            String::from_utf8_lossy(bytes).into_owned()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn looks_like_html(content_type: &str, body: &str) -> bool {
    content_type.contains("html") || body.contains("<html") || body.contains("<body")
}

static SCRIPT_STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</\1>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

fn sanitize_html(body: &str) -> String {
    let without_scripts = SCRIPT_STYLE_RE.replace_all(body, "");
    let without_tags = TAG_RE.replace_all(&without_scripts, " ");
    let unescaped = unescape_entities(&without_tags);
    WHITESPACE_RE.replace_all(unescaped.trim(), " ").into_owned()
}

fn unescape_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}
