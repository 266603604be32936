//! Account-level conversation maintenance: listing, history and deletion.

use std::sync::Arc;

use futures_util::future;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::bootstrap::ConnectionBootstrap;
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::headers::{self, HeaderSet};
use crate::retry::RetryPolicy;
use crate::sessions::{ConversationHandle, SessionStore};

/// Which conversations [`Conversations::delete_many`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteSelection {
    /// The newest `n` known conversations.
    Count(usize),
    All,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatList {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    chats: Vec<ConversationHandle>,
}

pub struct Conversations {
    bootstrap: Arc<ConnectionBootstrap>,
    delete_http: reqwest::Client,
    chat_service_url: String,
}

impl Conversations {
    pub fn new(
        config: &ClientConfig,
        bootstrap: Arc<ConnectionBootstrap>,
        forwarded_ip: &str,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().default_headers(headers::header_map(
            HeaderSet::Delete,
            config,
            forwarded_ip,
        )?);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            bootstrap,
            delete_http: builder.build()?,
            chat_service_url: config.chat_service_url.trim_end_matches('/').to_string(),
        })
    }

    fn store(&self) -> &SessionStore {
        self.bootstrap.store()
    }

    /// Fetch the account's conversations and record them as ongoing.
    pub async fn list(&self) -> Result<Vec<ConversationHandle>> {
        RetryPolicy::list_conversations()
            .run("list_conversations", |_| self.list_once())
            .await
    }

    async fn list_once(&self) -> Result<Vec<ConversationHandle>> {
        let url = format!("{}/turing/conversation/chats", self.bootstrap.service_url());
        let list: ChatList = self
            .bootstrap
            .http()
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.store().set_client_id(list.client_id);
        let handles = list
            .chats
            .into_iter()
            .filter(|chat| !chat.conversation_id.is_empty())
            .map(|mut chat| {
                chat.is_start = Some(false);
                let id = chat.conversation_id.clone();
                self.store().upsert(&id, chat)
            })
            .collect::<Vec<_>>();
        info!(count = handles.len(), "fetched conversation list");
        Ok(handles)
    }

    /// Fetch a conversation's messages into the store.
    pub async fn fetch_history(&self, id: &str) -> Result<Vec<Value>> {
        let handle = self
            .store()
            .get(id)
            .ok_or_else(|| ChatError::UnknownConversation(id.to_string()))?;
        RetryPolicy::fetch_history()
            .run("fetch_history", |_| self.fetch_history_once(&handle))
            .await
    }

    async fn fetch_history_once(&self, handle: &ConversationHandle) -> Result<Vec<Value>> {
        let mut url = format!(
            "{}/sydney/GetConversation?conversationId={}&source=cib&participantId={}",
            self.chat_service_url,
            urlencoding::encode(&handle.conversation_id),
            urlencoding::encode(&self.store().client_id())
        );
        if let Some(signature) = handle.conversation_signature.as_deref() {
            url.push_str("&conversationSignature=");
            url.push_str(&urlencoding::encode(signature));
        }
        url.push_str(&format!("&traceId={}", uuid::Uuid::new_v4()));

        let data: Value = self
            .bootstrap
            .http()
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let messages = data
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        self.store()
            .set_history(&handle.conversation_id, messages.clone());
        Ok(messages)
    }

    /// Refresh the token of one conversation, and fetch its history too when
    /// `load_history` is set. Both requests run concurrently.
    pub async fn load(&self, id: &str, load_history: bool) -> Result<()> {
        if load_history {
            tokio::try_join!(self.bootstrap.refresh_token(id), self.fetch_history(id))?;
        } else {
            self.bootstrap.refresh_token(id).await?;
        }
        Ok(())
    }

    /// [`load`](Self::load) every stored conversation concurrently.
    pub async fn load_all(&self, load_history: bool) -> Result<()> {
        let ids = self.store().ids();
        future::try_join_all(ids.iter().map(|id| self.load(id, load_history))).await?;
        info!(count = ids.len(), load_history, "loaded conversations");
        Ok(())
    }

    /// Delete a conversation remotely and forget it locally.
    ///
    /// An id the store does not know triggers one refresh of the list.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.store().contains(id) {
            self.list().await?;
            self.load_all(false).await?;
        }
        let handle = self
            .store()
            .get(id)
            .ok_or_else(|| ChatError::UnknownConversation(id.to_string()))?;

        RetryPolicy::delete_conversation()
            .run("delete_conversation", |_| self.delete_once(&handle))
            .await?;
        self.store().remove(id);
        info!(conversation_id = %id, "deleted conversation");
        Ok(())
    }

    async fn delete_once(&self, handle: &ConversationHandle) -> Result<()> {
        let body = json!({
            "conversationId": handle.conversation_id,
            "conversationSignature": handle.conversation_signature,
            "participant": {"id": self.store().client_id()},
            "source": "cib",
            "optionsSets": ["autosave"],
        });
        let resp = self
            .delete_http
            .post(format!(
                "{}/sydney/DeleteSingleConversation",
                self.chat_service_url
            ))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(ChatError::Remote {
            value: status.to_string(),
            message: resp.text().await.unwrap_or_default(),
        })
    }

    /// Delete several conversations concurrently. Individual failures are
    /// logged and skipped. Returns how many were deleted.
    pub async fn delete_many(&self, selection: DeleteSelection) -> usize {
        let mut handles = self.store().list();
        // Newest first; conversations without a timestamp go last.
        handles.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let DeleteSelection::Count(count) = selection {
            if count > handles.len() {
                warn!(requested = count, found = handles.len(), "fewer conversations than requested");
            }
            handles.truncate(count);
        }

        let results = future::join_all(handles.iter().map(|handle| async move {
            let id = &handle.conversation_id;
            match self.delete(id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "failed to delete conversation");
                    false
                }
            }
        }))
        .await;
        results.into_iter().filter(|deleted| *deleted).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok, response, serve};

    fn conversations(url: &str, store: Arc<SessionStore>) -> Conversations {
        let config = ClientConfig {
            service_url: url.to_string(),
            chat_service_url: url.to_string(),
            ..ClientConfig::default()
        };
        let bootstrap = Arc::new(ConnectionBootstrap::new(&config, store, "13.104.0.1").unwrap());
        Conversations::new(&config, bootstrap, "13.104.0.1").unwrap()
    }

    #[tokio::test]
    async fn list_records_client_and_ongoing_conversations() {
        let (url, mut requests) = serve(vec![ok(
            r#"{"clientId":"914798","chats":[{"conversationId":"a","chatName":"hi"},{"conversationId":"b","conversationSignature":"sig"}]}"#,
        )])
        .await;
        let store = Arc::new(SessionStore::new());
        let listed = conversations(&url, store.clone()).list().await.unwrap();

        assert_eq!(listed.len(), 2);
        assert_eq!(store.client_id(), "914798");
        let a = store.get("a").unwrap();
        assert_eq!(a.is_start, Some(false));
        assert_eq!(a.extra["chatName"], "hi");
        assert!(!a.is_start_of_conversation());
        assert_eq!(
            store.get("b").unwrap().conversation_signature.as_deref(),
            Some("sig")
        );
        assert_eq!(
            requests.recv().await.unwrap().line,
            "GET /turing/conversation/chats HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn history_replaces_stored_messages() {
        let (url, mut requests) = serve(vec![ok(
            r#"{"messages":[{"author":"user","text":"hi"},{"author":"bot","text":"hello"}]}"#,
        )])
        .await;
        let store = Arc::new(SessionStore::new());
        store.set_client_id("914798");
        store.upsert("a", ConversationHandle::new("a").with_signature("s/g"));

        let messages = conversations(&url, store.clone())
            .fetch_history("a")
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(store.history("a").unwrap()[1]["text"], "hello");

        let line = requests.recv().await.unwrap().line;
        assert!(line.starts_with(
            "GET /sydney/GetConversation?conversationId=a&source=cib&participantId=914798&conversationSignature=s%2Fg&traceId="
        ));
    }

    #[tokio::test]
    async fn history_of_unknown_conversation_fails() {
        let store = Arc::new(SessionStore::new());
        let err = conversations("http://127.0.0.1:1", store)
            .fetch_history("nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::UnknownConversation(id) if id == "nope"));
    }

    #[tokio::test]
    async fn delete_removes_known_conversation() {
        let (url, mut requests) = serve(vec![ok("{}")]).await;
        let store = Arc::new(SessionStore::new());
        store.set_client_id("914798");
        store.upsert("a", ConversationHandle::new("a").with_signature("sig"));

        conversations(&url, store.clone()).delete("a").await.unwrap();
        assert!(!store.contains("a"));

        let request = requests.recv().await.unwrap();
        assert_eq!(request.line, "POST /sydney/DeleteSingleConversation HTTP/1.1");
        let body: Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["conversationId"], "a");
        assert_eq!(body["conversationSignature"], "sig");
        assert_eq!(body["participant"]["id"], "914798");
    }

    #[tokio::test]
    async fn delete_unknown_refreshes_list_first() {
        let (url, mut requests) =
            serve(vec![ok(r#"{"clientId":"914798","chats":[]}"#)]).await;
        let store = Arc::new(SessionStore::new());

        let err = conversations(&url, store).delete("ghost").await.unwrap_err();
        assert!(matches!(err, ChatError::UnknownConversation(id) if id == "ghost"));
        assert_eq!(
            requests.recv().await.unwrap().line,
            "GET /turing/conversation/chats HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn delete_many_swallows_failures() {
        let store = Arc::new(SessionStore::new());
        let mut older = ConversationHandle::new("old");
        older.created_at = Some(10);
        let mut newer = ConversationHandle::new("new");
        newer.created_at = Some(20);
        store.upsert("old", older);
        store.upsert("new", newer);

        let (url, mut requests) = serve(vec![ok("{}")]).await;
        let deleted = conversations(&url, store.clone())
            .delete_many(DeleteSelection::Count(1))
            .await;
        assert_eq!(deleted, 1);
        assert!(!store.contains("new"));
        assert!(store.contains("old"));
        assert!(requests.recv().await.unwrap().line.starts_with("POST"));

        // Server refuses: the failure is logged and nothing is removed.
        let refusals = (0..3).map(|_| response(500, "", "nope")).collect();
        let (url, _requests) = serve(refusals).await;
        let deleted = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            conversations(&url, store.clone()).delete_many(DeleteSelection::All),
        )
        .await
        .unwrap();
        assert_eq!(deleted, 0);
        assert!(store.contains("old"));
    }
}
