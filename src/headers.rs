//! Browser-like request headers for the service endpoints.
//!
//! The service rejects requests that do not look like they come from a
//! desktop browser, so each endpoint family gets the header set a browser
//! would send, plus the account cookies and a forwarded address.

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::ClientConfig;
use crate::error::{ChatError, Result};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36";

const SERVICE: &[(&str, &str)] = &[
    ("referer", "https://www.bing.com/search?q=Bing"),
    (
        "sec-ch-ua",
        r#""Not/A)Brand";v="99", "Google Chrome";v="115", "Chromium";v="115""#,
    ),
    ("sec-ch-ua-arch", r#""x86""#),
    ("sec-ch-ua-bitness", r#""64""#),
    ("sec-ch-ua-full-version", r#""115.0.5790.171""#),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""Windows""#),
    ("sec-ch-ua-platform-version", r#""15.0.0""#),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    ("user-agent", USER_AGENT),
    (
        "x-ms-useragent",
        "azsdk-js-api-client-factory/1.0.0-beta.1 core-rest-pipeline/1.10.3 OS/Windows",
    ),
];

const SOCKET: &[(&str, &str)] = &[
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    ("user-agent", USER_AGENT),
];

const DELETE: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
    ("content-type", "application/json"),
    ("pragma", "no-cache"),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-site"),
    ("referer", "https://www.bing.com/"),
    ("user-agent", USER_AGENT),
];

const DRAW: &[(&str, &str)] = &[
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8",
    ),
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""Windows""#),
    ("sec-fetch-dest", "iframe"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "same-origin"),
    ("upgrade-insecure-requests", "1"),
    ("referer", "https://www.bing.com/search?q=Bing+Ai"),
    ("user-agent", USER_AGENT),
];

const UPLOAD: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""Windows""#),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    ("referer", "https://www.bing.com/search?q=1"),
    ("user-agent", USER_AGENT),
];

/// Endpoint family a header set is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSet {
    /// Conversation creation, listing and history.
    Service,
    /// The chat hub socket upgrade.
    Socket,
    Delete,
    Draw,
    /// Image attachment upload. The multipart content type is set per request.
    Upload,
}

impl HeaderSet {
    fn fixed(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Service => SERVICE,
            Self::Socket => SOCKET,
            Self::Delete => DELETE,
            Self::Draw => DRAW,
            Self::Upload => UPLOAD,
        }
    }

    fn forwards_ip(self) -> bool {
        !matches!(self, Self::Delete)
    }
}

/// A random address in the service's own range, sent as `x-forwarded-for`.
pub fn forwarded_ip() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "13.{}.{}.{}",
        rng.gen_range(104..=107),
        rng.gen_range(0..=255),
        rng.gen_range(0..=255)
    )
}

/// Name/value pairs of a header set, cookies and forwarded address included.
pub fn header_pairs(set: HeaderSet, config: &ClientConfig, ip: &str) -> Vec<(&'static str, String)> {
    let mut pairs: Vec<(&'static str, String)> = set
        .fixed()
        .iter()
        .map(|(name, value)| (*name, (*value).to_string()))
        .collect();
    if set.forwards_ip() {
        pairs.push(("x-forwarded-for", ip.to_string()));
    }
    if set == HeaderSet::Service {
        pairs.push(("x-ms-client-request-id", uuid::Uuid::new_v4().to_string()));
    }
    if let Some(cookie) = config.cookie_header() {
        pairs.push(("cookie", cookie));
    }
    pairs
}

/// A header set as a reqwest [`HeaderMap`].
pub fn header_map(set: HeaderSet, config: &ClientConfig, ip: &str) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in header_pairs(set, config, ip) {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ChatError::Config(format!("invalid value for header {name}: {e}")))?;
        map.insert(HeaderName::from_static(name), value);
    }
    Ok(map)
}

pub fn service_headers(config: &ClientConfig, ip: &str) -> Result<HeaderMap> {
    header_map(HeaderSet::Service, config, ip)
}

pub fn upload_headers(config: &ClientConfig, ip: &str) -> Result<HeaderMap> {
    header_map(HeaderSet::Upload, config, ip)
}

pub fn draw_headers(config: &ClientConfig, ip: &str) -> Result<HeaderMap> {
    header_map(HeaderSet::Draw, config, ip)
}
