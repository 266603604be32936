//! Conversation creation and socket-token management.

use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::multipart::Form;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::headers;
use crate::request::ConversationStyle;
use crate::retry::RetryPolicy;
use crate::sessions::{ConversationHandle, SessionStore, now_secs};

/// Response header carrying the bootstrap bearer token.
pub const SIGNATURE_HEADER: &str = "x-sydney-encryptedconversationsignature";

/// Creates conversations and keeps their socket tokens fresh.
pub struct ConnectionBootstrap {
    http: reqwest::Client,
    /// Client for image attachment uploads.
    upload_http: reqwest::Client,
    store: Arc<SessionStore>,
    service_url: String,
    wss_link: String,
    token_freshness_secs: u64,
}

impl ConnectionBootstrap {
    pub fn new(config: &ClientConfig, store: Arc<SessionStore>, forwarded_ip: &str) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().default_headers(headers::service_headers(config, forwarded_ip)?);
        let mut upload_builder =
            reqwest::Client::builder().default_headers(headers::upload_headers(config, forwarded_ip)?);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
            upload_builder = upload_builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            upload_http: upload_builder.build()?,
            store,
            service_url: config.service_url.trim_end_matches('/').to_string(),
            wss_link: config.wss_link().to_string(),
            token_freshness_secs: config.token_freshness_secs,
        })
    }

    /// HTTP client carrying the service headers.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    /// Create a new conversation and record it in the store.
    pub async fn create_conversation(&self) -> Result<ConversationHandle> {
        RetryPolicy::create_conversation()
            .run("create_conversation", |_| self.create_once())
            .await
    }

    async fn create_once(&self) -> Result<ConversationHandle> {
        let url = format!("{}/turing/conversation/create", self.service_url);
        let resp = self.http.get(&url).send().await?;
        let access_token = signature_token(resp.headers());
        let body = resp.text().await?;

        let mut handle: ConversationHandle = match serde_json::from_str(&body) {
            Ok(handle) => handle,
            Err(_) => return Err(ChatError::Auth(body)),
        };
        if handle.conversation_id.is_empty() {
            return Err(ChatError::Auth(body));
        }
        handle.access_token = access_token;
        handle.created_at = Some(now_secs());

        let id = handle.conversation_id.clone();
        info!(conversation_id = %id, "created conversation");
        Ok(self.store.upsert(&id, handle))
    }

    /// Re-request a socket token for an existing conversation.
    ///
    /// A response without the signature header leaves the handle unchanged.
    pub async fn refresh_token(&self, id: &str) -> Result<()> {
        RetryPolicy::refresh_token()
            .run("refresh_token", |_| self.refresh_once(id))
            .await
    }

    async fn refresh_once(&self, id: &str) -> Result<()> {
        let url = format!(
            "{}/turing/conversation/create?conversationId={}",
            self.service_url,
            urlencoding::encode(id)
        );
        let resp = self.http.get(&url).send().await?;
        match signature_token(resp.headers()) {
            Some(token) => {
                debug!(conversation_id = %id, "refreshed access token");
                let mut update = ConversationHandle::new(id);
                update.access_token = Some(token);
                self.store.upsert(id, update);
            }
            None => debug!(conversation_id = %id, "no access token issued"),
        }
        Ok(())
    }

    /// Register `handle` with the store, refresh its token when the
    /// freshness rule asks for it and return the current snapshot.
    ///
    /// Stored fields take precedence over the caller's copy, which may
    /// predate an earlier refresh.
    pub async fn ensure_fresh(&self, handle: &ConversationHandle) -> Result<ConversationHandle> {
        let id = handle.conversation_id.clone();
        let current = self.store.adopt(handle.clone());
        if !current.needs_refresh(now_secs(), self.token_freshness_secs) {
            return Ok(current);
        }
        self.refresh_token(&id).await?;
        self.store.record_refresh(&id, None, now_secs());
        self.store
            .get(&id)
            .ok_or(ChatError::UnknownConversation(id))
    }

    /// Upload a base64-encoded image for the next turn of a conversation.
    ///
    /// Returns the blob URL to attach to the request, or `None` when the
    /// service accepted the upload without issuing a blob id.
    pub async fn upload_image(
        &self,
        handle: &ConversationHandle,
        style: ConversationStyle,
        image_base64: &str,
    ) -> Result<Option<String>> {
        let knowledge_request = json!({
            "imageInfo": {},
            "knowledgeRequest": {
                "invokedSkills": ["ImageById"],
                "subscriptionId": "Bing.Chat.Multimodal",
                "invokedSkillsRequestData": {"enableFaceBlur": false},
                "convoData": {
                    "convoid": handle.conversation_id,
                    "convotone": style.tone(),
                },
            },
        })
        .to_string();

        let blob_id = RetryPolicy::upload_image()
            .run("upload_image", |_| {
                self.upload_once(knowledge_request.clone(), image_base64.to_string())
            })
            .await?;
        if blob_id.is_empty() {
            debug!(conversation_id = %handle.conversation_id, "upload issued no blob id");
            return Ok(None);
        }
        info!(conversation_id = %handle.conversation_id, %blob_id, "uploaded image");
        Ok(Some(blob_url(&self.service_url, &blob_id)))
    }

    async fn upload_once(&self, knowledge_request: String, image_base64: String) -> Result<String> {
        let form = Form::new()
            .text("knowledgeRequest", knowledge_request)
            .text("imageBase64", image_base64);
        let resp = self
            .upload_http
            .post(format!("{}/images/kblob", self.service_url))
            .multipart(form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ChatError::Auth(body));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|_| ChatError::Auth(body.clone()))?;
        match parsed.get("blobId") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Null) => Ok(String::new()),
            _ => Err(ChatError::Auth(body)),
        }
    }

    /// Socket endpoint for a conversation.
    pub fn socket_url(&self, handle: &ConversationHandle) -> String {
        socket_url(&self.wss_link, handle)
    }
}

/// The chat hub URL, with `sec_access_token` on the token path.
pub fn socket_url(wss_link: &str, handle: &ConversationHandle) -> String {
    if handle.uses_token_auth() {
        format!(
            "{}?sec_access_token={}",
            wss_link,
            handle.access_token.as_deref().unwrap_or_default()
        )
    } else {
        wss_link.to_string()
    }
}

/// Address of an uploaded image blob.
pub fn blob_url(service_url: &str, blob_id: &str) -> String {
    format!("{service_url}/images/blob?bcid={blob_id}")
}

/// The signature header, URL-escaped, if the response carries one.
fn signature_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| urlencoding::encode(v).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok, response, serve};

    fn bootstrap(service_url: String, store: Arc<SessionStore>) -> ConnectionBootstrap {
        let config = ClientConfig {
            service_url,
            wss_link: Some("ws://127.0.0.1:1/sydney/ChatHub".into()),
            ..ClientConfig::default()
        };
        ConnectionBootstrap::new(&config, store, "13.104.0.1").unwrap()
    }

    #[tokio::test]
    async fn create_captures_escaped_token() {
        let (url, mut requests) = serve(vec![response(
            200,
            "x-sydney-encryptedconversationsignature: a+b/c=\r\n",
            r#"{"conversationId":"c1","clientId":"914798","result":{"value":"Success"}}"#,
        )])
        .await;
        let store = Arc::new(SessionStore::new());
        let handle = bootstrap(url, store.clone()).create_conversation().await.unwrap();

        assert_eq!(handle.conversation_id, "c1");
        assert_eq!(handle.access_token.as_deref(), Some("a%2Bb%2Fc%3D"));
        assert!(handle.created_at.is_some());
        assert!(store.contains("c1"));
        assert_eq!(
            requests.recv().await.unwrap().line,
            "GET /turing/conversation/create HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn unparseable_body_is_auth_error() {
        let page = "<html>sign in</html>";
        let responses = (0..10).map(|_| ok(page)).collect();
        let (url, _requests) = serve(responses).await;
        let store = Arc::new(SessionStore::new());
        let bootstrap = bootstrap(url, store);

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            bootstrap.create_conversation(),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, ChatError::RetryExhausted { attempts: 10, .. }));
        assert!(matches!(err.root(), ChatError::Auth(body) if body == page));
    }

    #[tokio::test]
    async fn missing_header_keeps_handle_unchanged() {
        let (url, mut requests) = serve(vec![ok("{}")]).await;
        let store = Arc::new(SessionStore::new());
        store.upsert("c|1", ConversationHandle::new("c|1"));
        let bootstrap = bootstrap(url, store.clone());

        bootstrap.refresh_token("c|1").await.unwrap();
        assert!(store.get("c|1").unwrap().access_token.is_none());
        assert_eq!(
            requests.recv().await.unwrap().line,
            "GET /turing/conversation/create?conversationId=c%7C1 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn signed_handle_skips_refresh() {
        let store = Arc::new(SessionStore::new());
        // No server: any HTTP call would fail.
        let bootstrap = bootstrap("http://127.0.0.1:1".into(), store.clone());
        let handle = ConversationHandle::new("c1").with_signature("sig");

        let fresh = bootstrap.ensure_fresh(&handle).await.unwrap();
        assert_eq!(fresh.conversation_signature.as_deref(), Some("sig"));
        assert_eq!(
            bootstrap.socket_url(&fresh),
            "ws://127.0.0.1:1/sydney/ChatHub"
        );
    }

    #[tokio::test]
    async fn stored_token_wins_over_stale_caller_copy() {
        let store = Arc::new(SessionStore::new());
        let mut stored = ConversationHandle::new("c1");
        stored.access_token = Some("new-token".into());
        stored.created_at = Some(now_secs());
        store.upsert("c1", stored);
        // No server: a refresh attempt would fail the call.
        let bootstrap = bootstrap("http://127.0.0.1:1".into(), store.clone());

        let mut held = ConversationHandle::new("c1");
        held.access_token = Some("old-token".into());
        held.created_at = Some(now_secs() - 3600);
        let fresh = bootstrap.ensure_fresh(&held).await.unwrap();

        assert_eq!(fresh.access_token.as_deref(), Some("new-token"));
        assert_eq!(store.get("c1").unwrap().access_token.as_deref(), Some("new-token"));
        assert_eq!(
            bootstrap.socket_url(&fresh),
            "ws://127.0.0.1:1/sydney/ChatHub?sec_access_token=new-token"
        );
    }

    #[tokio::test]
    async fn upload_sends_form_and_returns_blob_url() {
        let (url, mut requests) = serve(vec![ok(r#"{"blobId":"b-42","processedBlobId":"p"}"#)]).await;
        let bootstrap = bootstrap(url.clone(), Arc::new(SessionStore::new()));
        let handle = ConversationHandle::new("c1");

        let image_url = bootstrap
            .upload_image(&handle, ConversationStyle::Precise, "aGVsbG8=")
            .await
            .unwrap();
        assert_eq!(image_url, Some(format!("{url}/images/blob?bcid=b-42")));

        let request = requests.recv().await.unwrap();
        assert_eq!(request.line, "POST /images/kblob HTTP/1.1");
        assert!(request.body.contains(r#"name="knowledgeRequest""#));
        assert!(request.body.contains(r#""convoid":"c1""#));
        assert!(request.body.contains(r#""convotone":"Precise""#));
        assert!(request.body.contains(r#"name="imageBase64""#));
        assert!(request.body.contains("aGVsbG8="));
    }

    #[tokio::test]
    async fn rejected_upload_is_retried_then_fails() {
        let responses = (0..3).map(|_| response(403, "", "denied")).collect();
        let (url, _requests) = serve(responses).await;
        let bootstrap = bootstrap(url, Arc::new(SessionStore::new()));

        let err = bootstrap
            .upload_image(&ConversationHandle::new("c1"), ConversationStyle::Creative, "eA==")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RetryExhausted { attempts: 3, .. }));
        assert!(matches!(err.root(), ChatError::Auth(body) if body == "denied"));
    }

    #[test]
    fn socket_url_carries_token() {
        let mut handle = ConversationHandle::new("c1").with_signature("sig");
        handle.access_token = Some("tok%2B".into());
        assert_eq!(
            socket_url("wss://host/hub", &handle),
            "wss://host/hub?sec_access_token=tok%2B"
        );

        // No signature and no token yet: empty token parameter.
        assert_eq!(
            socket_url("wss://host/hub", &ConversationHandle::new("c1")),
            "wss://host/hub?sec_access_token="
        );
    }
}
