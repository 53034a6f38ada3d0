//! Detection of local server URLs in process output.
//!
//! When a snippet or shell starts a dev server, the URL it prints is surfaced
//! to the client as a `streamPreview` event so the UI can offer a link.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Longest unterminated line kept between chunks.
const MAX_CARRY: usize = 512;

static LOCAL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\d{1,3}(?:\.\d{1,3}){3}):\d{1,5}")
        .expect("Invalid regex pattern for local server URLs")
});

/// Per-stream URL scanner. Each URL is reported once.
#[derive(Debug, Default)]
pub struct PreviewDetector {
    seen: HashSet<String>,
    carry: String,
}

impl PreviewDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans one output chunk and returns URLs not reported before.
    ///
    /// The unterminated tail of the previous chunk is prepended so that a URL
    /// split across two reads is still found.
    pub fn scan(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(&String::from_utf8_lossy(chunk));

        // The port may continue in the next chunk.
        let found = self.matches(&text, false);

        let tail = match text.rfind('\n') {
            Some(pos) => &text[pos + 1..],
            None => text.as_str(),
        };
        if tail.len() <= MAX_CARRY {
            self.carry = tail.to_string();
        }
        found
    }

    /// Reports a URL left at the very end of the output once the stream has
    /// no more chunks to come.
    pub fn finish(&mut self) -> Vec<String> {
        let text = std::mem::take(&mut self.carry);
        self.matches(&text, true)
    }

    fn matches(&mut self, text: &str, complete: bool) -> Vec<String> {
        let mut found = Vec::new();
        for m in LOCAL_URL.find_iter(text) {
            if !complete && m.end() == text.len() {
                continue;
            }
            let url = normalize(m.as_str());
            if self.seen.insert(url.clone()) {
                found.push(url);
            }
        }
        found
    }
}

/// Wildcard binds are not browsable; point them at loopback.
fn normalize(url: &str) -> String {
    url.replacen("://0.0.0.0:", "://127.0.0.1:", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_common_dev_server_banners() {
        let mut detector = PreviewDetector::new();
        assert_eq!(
            detector.scan(b" * Running on http://127.0.0.1:5000\n"),
            ["http://127.0.0.1:5000"]
        );
        assert_eq!(
            detector.scan(b"Uvicorn running on http://0.0.0.0:8000 (Press CTRL+C)\n"),
            ["http://127.0.0.1:8000"]
        );
        assert_eq!(
            detector.scan(b"  Local:   http://localhost:5173/\n"),
            ["http://localhost:5173"]
        );
        assert!(detector.scan(b"see https://example.com for docs\n").is_empty());
    }

    #[test]
    fn test_reports_each_url_once() {
        let mut detector = PreviewDetector::new();
        assert_eq!(detector.scan(b"http://localhost:3000\n").len(), 1);
        assert!(detector.scan(b"http://localhost:3000\n").is_empty());
    }

    #[test]
    fn test_url_split_across_chunks() {
        let mut detector = PreviewDetector::new();
        assert!(detector.scan(b"listening on http://127.0.").is_empty());
        assert!(detector.scan(b"0.1:80").is_empty());
        assert_eq!(detector.scan(b"80\n"), ["http://127.0.0.1:8080"]);
    }

    #[test]
    fn test_trailing_url_is_reported_at_end_of_output() {
        let mut detector = PreviewDetector::new();
        assert!(detector.scan(b"serving on http://0.0.0.0:8000").is_empty());
        assert_eq!(detector.finish(), ["http://127.0.0.1:8000"]);
        assert!(detector.finish().is_empty());

        let mut detector = PreviewDetector::new();
        assert_eq!(
            detector.scan(b"http://localhost:3000\nhttp://localhost:3000"),
            ["http://localhost:3000"]
        );
        assert!(detector.finish().is_empty());
    }
}
