//! Per-conversation state kept for the lifetime of a client.
//!
//! The store maps conversation ids to [`ConversationHandle`]s. Updates merge
//! field by field: whatever the update carries wins, whatever it leaves out
//! is kept from the existing entry. Entries are only removed on explicit
//! deletion.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Conversation id as issued by the service.
pub type ConversationId = String;

/// Everything the client knows about one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHandle {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_signature: Option<String>,
    /// URL-escaped bootstrap bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Unix seconds of the last creation or token refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_start: Option<bool>,
    /// Raw message records, oldest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Value>>,
    /// Remaining fields of the service's conversation record.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversationHandle {
    pub fn new(conversation_id: impl Into<ConversationId>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.conversation_signature = Some(signature.into());
        self
    }

    /// Whether the next turn opens the conversation.
    ///
    /// A handle with recorded history is never at the start.
    pub fn is_start_of_conversation(&self) -> bool {
        self.messages.is_none() && self.is_start.unwrap_or(true)
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_signature(&self) -> bool {
        self.conversation_signature
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    /// Token refresh rule.
    ///
    /// Refresh when the handle authenticates by token or lacks a signature,
    /// and additionally its timestamp is missing, older than
    /// `freshness_secs`, or the signature is missing.
    pub fn needs_refresh(&self, now: u64, freshness_secs: u64) -> bool {
        let token_path = self.has_access_token() || !self.has_signature();
        let stale = match self.created_at {
            None => true,
            Some(at) => now.saturating_sub(at) > freshness_secs,
        };
        token_path && (stale || !self.has_signature())
    }

    /// Whether the socket URL should carry `sec_access_token`.
    pub fn uses_token_auth(&self) -> bool {
        self.has_access_token() || !self.has_signature()
    }

    /// Field-level merge: fields present in `update` override.
    pub fn merge(&mut self, update: ConversationHandle) {
        if !update.conversation_id.is_empty() {
            self.conversation_id = update.conversation_id;
        }
        if update.conversation_signature.is_some() {
            self.conversation_signature = update.conversation_signature;
        }
        if update.access_token.is_some() {
            self.access_token = update.access_token;
        }
        if update.created_at.is_some() {
            self.created_at = update.created_at;
        }
        if update.is_start.is_some() {
            self.is_start = update.is_start;
        }
        if update.messages.is_some() {
            self.messages = update.messages;
        }
        self.extra.extend(update.extra);
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    handles: HashMap<ConversationId, ConversationHandle>,
    /// Participant id reported with the conversation list.
    client_id: String,
}

/// Process-wide conversation store.
///
/// Critical sections never span an await point, so a blocking mutex is
/// enough even when several conversations run on different threads.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a snapshot of a conversation.
    pub fn get(&self, id: &str) -> Option<ConversationHandle> {
        self.lock().handles.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().handles.contains_key(id)
    }

    /// Insert or merge a conversation and return the merged snapshot.
    pub fn upsert(&self, id: &str, update: ConversationHandle) -> ConversationHandle {
        let mut inner = self.lock();
        let entry = inner
            .handles
            .entry(id.to_string())
            .or_insert_with(|| ConversationHandle::new(id));
        entry.merge(update);
        entry.clone()
    }

    /// Register a caller-held handle without letting it override the store.
    ///
    /// Fields the store already knows win; the handle only fills the gaps.
    /// Returns the merged snapshot.
    pub fn adopt(&self, handle: ConversationHandle) -> ConversationHandle {
        let mut inner = self.lock();
        let id = handle.conversation_id.clone();
        let mut merged = handle;
        if let Some(stored) = inner.handles.remove(&id) {
            merged.merge(stored);
        }
        inner.handles.insert(id, merged.clone());
        merged
    }

    /// Record a fresh token (if any) and stamp the refresh time.
    pub fn record_refresh(&self, id: &str, access_token: Option<String>, now: u64) {
        let mut update = ConversationHandle::new(id);
        update.access_token = access_token;
        update.created_at = Some(now);
        self.upsert(id, update);
    }

    /// Append terminal-frame messages to a conversation's history.
    ///
    /// Initializes the history when none exists yet.
    pub fn append_history(&self, id: &str, messages: Vec<Value>) {
        let mut inner = self.lock();
        let entry = inner
            .handles
            .entry(id.to_string())
            .or_insert_with(|| ConversationHandle::new(id));
        entry.messages.get_or_insert_with(Vec::new).extend(messages);
    }

    /// Replace a conversation's history wholesale.
    pub fn set_history(&self, id: &str, messages: Vec<Value>) {
        let mut update = ConversationHandle::new(id);
        update.messages = Some(messages);
        self.upsert(id, update);
    }

    pub fn history(&self, id: &str) -> Option<Vec<Value>> {
        self.lock().handles.get(id).and_then(|h| h.messages.clone())
    }

    pub fn remove(&self, id: &str) -> Option<ConversationHandle> {
        self.lock().handles.remove(id)
    }

    /// All conversations, in no particular order.
    pub fn list(&self) -> Vec<ConversationHandle> {
        self.lock().handles.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        self.lock().handles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }

    pub fn client_id(&self) -> String {
        self.lock().client_id.clone()
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) {
        self.lock().client_id = client_id.into();
    }
}

/// Current time in unix seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
