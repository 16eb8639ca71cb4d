//! URL extraction and YouTube link normalization.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s<>]+").expect("valid URL regex"));

const YOUTUBE_HOSTS: [&str; 4] = ["youtube.com", "www.youtube.com", "m.youtube.com", "youtu.be"];

/// First URL embedded in free text, if any.
pub fn find_url(text: &str) -> Option<&str> {
    URL_RE.find(text).map(|m| m.as_str())
}

/// Whether the URL points at the supported video provider.
pub fn is_youtube(raw: &str) -> bool {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| YOUTUBE_HOSTS.contains(&h)))
        .unwrap_or(false)
}

/// Canonicalize short-link forms to the long watch URL.
///
/// `https://youtu.be/<id>` becomes `https://www.youtube.com/watch?v=<id>`;
/// anything else is returned unchanged.
pub fn normalize_youtube(raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw) else {
        return raw.to_string();
    };

    if parsed.host_str() == Some("youtu.be") {
        let video_id = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default();
        if !video_id.is_empty() {
            return format!("https://www.youtube.com/watch?v={video_id}");
        }
    }

    raw.to_string()
}
