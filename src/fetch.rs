use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use tracing::{debug, error, info};
use url::{form_urlencoded, Url};

use crate::config::FetchConfig;

// ── Constants ────────────────────────────────────────────────────────────────

/// Query parameter added to every image URL so caches never answer for us.
pub const CACHE_BUSTER_PARAM: &str = "_cb";

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid image URL: {0}")]
    InvalidUrl(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("image too large: more than {0} bytes")]
    TooLarge(usize),
    #[error("could not build HTTP client: {0}")]
    Client(String),
}

// ── Public result type ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

// ── Cache buster ─────────────────────────────────────────────────────────────

/// Append `_cb=<token>_<unix_secs>` to `url`.
///
/// Every other query segment is kept byte-for-byte; only segments whose
/// decoded key is `_cb` are dropped before the new value is appended.
pub fn with_cache_buster(url: &Url, token: &str, unix_secs: u64) -> Url {
    let mut busted = url.clone();

    if let Some(query) = url.query() {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|segment| !is_cache_buster(segment))
            .collect();
        if kept.iter().all(|segment| segment.is_empty()) {
            busted.set_query(None);
        } else {
            busted.set_query(Some(&kept.join("&")));
        }
    }

    busted
        .query_pairs_mut()
        .append_pair(CACHE_BUSTER_PARAM, &format!("{}_{}", token, unix_secs));
    busted
}

fn is_cache_buster(segment: &str) -> bool {
    form_urlencoded::parse(segment.as_bytes())
        .next()
        .is_some_and(|(key, _)| key == CACHE_BUSTER_PARAM)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── URL validation ───────────────────────────────────────────────────────────

fn parse_image_url(raw: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(FetchError::InvalidUrl(format!(
            "unsupported scheme {:?}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(FetchError::InvalidUrl("missing host".to_string()));
    }
    Ok(parsed)
}

// ── HTTP fetch ───────────────────────────────────────────────────────────────

/// Downloads images with a shared, immutable client. One attempt per call.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        let client = reqwest::ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            timeout: config.timeout,
            max_bytes: config.max_bytes,
        })
    }

    /// Fetch `image` with a cache buster derived from `token` and the current second.
    pub async fn fetch(&self, image: &str, token: &str) -> Result<FetchedImage, FetchError> {
        let result = match parse_image_url(image) {
            Ok(url) => {
                let url = with_cache_buster(&url, token, unix_now());
                self.fetch_once(url).await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(fetched) => info!(
                id = %token,
                bytes = fetched.bytes.len(),
                content_type = fetched.content_type.as_deref().unwrap_or("-"),
                "image fetched"
            ),
            Err(e) => error!(id = %token, image = %image, error = %e, "image fetch failed"),
        }
        result
    }

    async fn fetch_once(&self, url: Url) -> Result<FetchedImage, FetchError> {
        debug!(url = %url, "GET image");

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(FetchError::TooLarge(self.max_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify(e))? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        let bytes = Bytes::from(body);

        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if e.is_connect() {
            FetchError::Connect(e.to_string())
        } else {
            FetchError::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn appends_cache_buster_to_bare_url() {
        let busted = with_cache_buster(&url("https://img.example.com/a.png"), "req-1", 1700000000);
        assert_eq!(
            busted.as_str(),
            "https://img.example.com/a.png?_cb=req-1_1700000000"
        );
    }

    #[test]
    fn keeps_existing_query_verbatim() {
        let busted = with_cache_buster(
            &url("https://img.example.com/a.png?w=100&tag=x&tag=y&sig=a%2Bb"),
            "req-1",
            42,
        );
        assert_eq!(
            busted.query(),
            Some("w=100&tag=x&tag=y&sig=a%2Bb&_cb=req-1_42")
        );
    }

    #[test]
    fn replaces_existing_cache_buster() {
        let busted = with_cache_buster(&url("https://h.example/i?_cb=old&w=1"), "new", 7);
        let pairs: Vec<(String, String)> = busted
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("w".to_string(), "1".to_string()),
                ("_cb".to_string(), "new_7".to_string()),
            ]
        );
    }

    #[test]
    fn replacing_cache_buster_leaves_other_segments_untouched() {
        let busted = with_cache_buster(
            &url("https://h.example/i?sig=a%20b&flag&x=1&_cb=old&%5Fcb=older"),
            "t",
            1,
        );
        assert_eq!(busted.query(), Some("sig=a%20b&flag&x=1&_cb=t_1"));
    }

    #[test]
    fn lone_cache_buster_is_replaced() {
        let busted = with_cache_buster(&url("https://h.example/i?_cb=old"), "t", 2);
        assert_eq!(busted.as_str(), "https://h.example/i?_cb=t_2");
    }

    #[test]
    fn encodes_special_characters_in_token() {
        let busted = with_cache_buster(&url("https://h.example/i"), "a b&c=d", 1);
        assert_eq!(busted.query(), Some("_cb=a+b%26c%3Dd_1"));
    }

    #[test]
    fn preserves_fragment() {
        let busted = with_cache_buster(&url("https://h.example/i?x=1#frag"), "t", 1);
        assert_eq!(busted.as_str(), "https://h.example/i?x=1&_cb=t_1#frag");
    }

    #[test]
    fn cache_buster_varies_by_time_and_token() {
        let base = url("https://h.example/i?x=1");
        let first = with_cache_buster(&base, "same", 100);
        let later = with_cache_buster(&base, "same", 101);
        let other = with_cache_buster(&base, "other", 100);
        assert_ne!(first, later);
        assert_ne!(first, other);
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            parse_image_url("ftp://h.example/i.png"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_image_url("not a url"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_image_url("/relative/path.png"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(parse_image_url("http://h.example/i.png").is_ok());
    }

    #[tokio::test]
    async fn invalid_url_fails_without_network() {
        let fetcher = ImageFetcher::new(&FetchConfig::default()).unwrap();
        let err = fetcher.fetch("mailto:someone@example.com", "t").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
