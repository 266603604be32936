//! Image generation sub-protocol.
//!
//! A `GenerateContentQuery` message asks the client to draw. Drawing is a
//! redirect chain on the image-creation endpoint followed by polling a
//! results page until it is non-empty, then scraping `src="..."` links.
//! Every failure resolves to [`DrawOutcome::Refused`]; the conversation
//! turn is never aborted by image generation.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::events::{ChatEvent, Image};
use crate::headers;

pub const BLOCKED_APOLOGY: &str =
    "Your prompt has been blocked by Bing. Try to change any bad words and try again.";
pub const REDIRECT_FAILED: &str = "Drawing Failed: Redirect failed";
pub const RESULTS_FAILED: &str = "Drawing Failed: Could not get results";
pub const NO_IMAGES: &str = "Drawing Failed: No images are found.";

/// Phrase the creation endpoint uses for refused prompts (compared lowercase).
const BLOCK_MARKER: &str = "this prompt has been blocked";
/// Thumbnails and UI assets live on this host, never generated images.
const BLOCKED_CDN: &str = "r.bing.com";

static IMAGE_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"src="([^"]+)""#).expect("static regex"));

/// A response of the drawing endpoints, redirects not followed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrawResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

impl DrawResponse {
    fn is_redirect(&self) -> bool {
        self.status == 302
    }
}

/// HTTP access used by the drawing protocol.
#[async_trait]
pub trait DrawTransport: Send + Sync {
    /// GET `url` without following redirects.
    async fn get(&self, url: &str) -> Result<DrawResponse>;
}

/// [`DrawTransport`] over reqwest.
pub struct HttpDrawTransport {
    http: reqwest::Client,
}

impl HttpDrawTransport {
    pub fn new(config: &ClientConfig, forwarded_ip: &str) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .default_headers(headers::draw_headers(config, forwarded_ip)?)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.draw_timeout_secs));
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
        })
    }
}

#[async_trait]
impl DrawTransport for HttpDrawTransport {
    async fn get(&self, url: &str) -> Result<DrawResponse> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;
        Ok(DrawResponse {
            status,
            location,
            body,
        })
    }
}

/// How one drawing request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawOutcome {
    Images(Vec<Image>),
    Refused(String),
}

impl DrawOutcome {
    pub fn into_events(self) -> Vec<ChatEvent> {
        match self {
            Self::Images(images) => images.into_iter().map(ChatEvent::Image).collect(),
            Self::Refused(reason) => vec![ChatEvent::Apology(reason)],
        }
    }
}

/// Runs the drawing protocol. Cheap to clone into background tasks.
#[derive(Clone)]
pub struct ImageGenerator {
    transport: Arc<dyn DrawTransport>,
    service_url: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl ImageGenerator {
    pub fn new(transport: Arc<dyn DrawTransport>, config: &ClientConfig) -> Self {
        Self {
            transport,
            service_url: config.service_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(config.draw_poll_interval_ms),
            max_polls: config.draw_max_polls.max(1),
        }
    }

    /// Draw `prompt`. Never fails; errors become a refusal.
    pub async fn generate(&self, prompt: &str) -> DrawOutcome {
        info!(prompt, "generating images");
        match self.try_generate(prompt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "image generation failed");
                DrawOutcome::Refused(format!("Drawing Failed: {e}"))
            }
        }
    }

    async fn try_generate(&self, prompt: &str) -> Result<DrawOutcome> {
        let encoded_prompt = urlencoding::encode(&format!("prompt='{prompt}'")).into_owned();
        let create_url = format!(
            "{}/images/create?partner=sydney&re=1&showselective=1&sude=1&kseed=8000&SFX=3&q={}&iframeid={}",
            self.service_url,
            encoded_prompt,
            uuid::Uuid::new_v4()
        );

        let created = self.transport.get(&create_url).await?;
        if !created.is_redirect() {
            return Ok(DrawOutcome::Refused(REDIRECT_FAILED.to_string()));
        }
        if created.body.to_lowercase().contains(BLOCK_MARKER) {
            return Ok(DrawOutcome::Refused(BLOCKED_APOLOGY.to_string()));
        }

        let redirect_url = format!(
            "{}{}",
            self.service_url,
            created.location.as_deref().unwrap_or_default()
        );
        let redirect = self.follow_redirect(&redirect_url).await?;
        let outcome = match redirect {
            Redirect::Blocked => DrawOutcome::Refused(BLOCKED_APOLOGY.to_string()),
            Redirect::Failed => DrawOutcome::Refused(REDIRECT_FAILED.to_string()),
            Redirect::To(location) => {
                let request_id = location.rsplit("id=").next().unwrap_or_default();
                let polling_url = format!(
                    "{}/images/create/async/results/{}?q={}",
                    self.service_url, request_id, encoded_prompt
                );
                match self.poll_results(&polling_url).await? {
                    Some(content) => images_from_results(&content),
                    None => DrawOutcome::Refused(RESULTS_FAILED.to_string()),
                }
            }
        };
        Ok(outcome)
    }

    /// Follow the creation redirect, retrying once on the alternate route.
    async fn follow_redirect(&self, redirect_url: &str) -> Result<Redirect> {
        let first = self.transport.get(redirect_url).await?;
        if first.body.contains("blocked") {
            return Ok(Redirect::Blocked);
        }
        if first.is_redirect() {
            return Ok(Redirect::from_location(first.location));
        }

        debug!("redirect did not redirect, retrying alternate route");
        let second = self
            .transport
            .get(&redirect_url.replace("rt=4", "rt=3"))
            .await?;
        if second.body.contains("blocked") {
            return Ok(Redirect::Blocked);
        }
        if !second.is_redirect() {
            return Ok(Redirect::Failed);
        }
        Ok(Redirect::from_location(second.location))
    }

    /// Poll until the results page has content. `None` when the request
    /// fails or the poll budget runs out.
    async fn poll_results(&self, polling_url: &str) -> Result<Option<String>> {
        for _ in 0..self.max_polls {
            let resp = self.transport.get(polling_url).await?;
            if resp.status != 200 {
                return Ok(None);
            }
            if !resp.body.is_empty() {
                return Ok(Some(resp.body));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        warn!(max_polls = self.max_polls, "image results never arrived");
        Ok(None)
    }
}

enum Redirect {
    To(String),
    Blocked,
    Failed,
}

impl Redirect {
    fn from_location(location: Option<String>) -> Self {
        location.map_or(Self::Failed, Self::To)
    }
}

fn images_from_results(content: &str) -> DrawOutcome {
    let urls = extract_image_urls(content);
    if urls.is_empty() {
        return DrawOutcome::Refused(NO_IMAGES.to_string());
    }
    DrawOutcome::Images(
        urls.into_iter()
            .enumerate()
            .map(|(i, url)| Image::new(format!("img{}.png", i + 1), url))
            .collect(),
    )
}

/// Image links of a results page: sizing suffix stripped, duplicates and
/// CDN assets dropped, first-seen order kept.
pub fn extract_image_urls(html: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for capture in IMAGE_SRC.captures_iter(html) {
        let link = capture[1].split("?w=").next().unwrap_or_default();
        if link.contains(BLOCKED_CDN) || urls.iter().any(|u| u == link) {
            continue;
        }
        urls.push(link.to_string());
    }
    urls
}
