//! Typed events produced by one conversation turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sessions::ConversationHandle;

/// One unit of a turn's output stream. Events are never revised once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum ChatEvent {
    /// A conversation was created for this turn.
    NewChat(ConversationHandle),
    /// Progress message from the service ("Searching the web for ...").
    Notice(String),
    /// Newly streamed answer text.
    Text(String),
    SearchResult(SearchResults),
    /// A cited source, sent once per turn.
    SourceAttribution(SourceAttribution),
    SuggestedReply(String),
    /// Newly streamed refusal text, or a refusal from image generation.
    Apology(String),
    Limit(Limit),
    Image(Image),
    /// The service's final frame for a successful turn. Always last.
    TerminalResponse(Value),
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TerminalResponse(_))
    }
}

/// Web search results attached to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchResults {
    /// Entries of the `web_search_results` list.
    Parsed(Vec<Value>),
    /// The payload as received when it was not valid JSON.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub display_name: String,
    pub see_more_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
}

impl SourceAttribution {
    /// Identity used for per-turn de-duplication.
    pub fn key(&self) -> (String, String) {
        (self.display_name.clone(), self.see_more_url.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
}

impl Image {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            base64: None,
        }
    }
}

/// Message counters reported by the service's throttling payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    #[serde(rename = "numUserMessagesInConversation")]
    pub num_user_messages: u64,
    #[serde(rename = "maxNumUserMessagesInConversation")]
    pub max_num_user_messages: u64,
    #[serde(rename = "numLongDocSummaryUserMessagesInConversation", default)]
    pub num_long_doc_summary_user_messages: u64,
    #[serde(rename = "maxNumLongDocSummaryUserMessagesInConversation", default)]
    pub max_num_long_doc_summary_user_messages: u64,
}

impl Limit {
    pub fn is_exhausted(&self) -> bool {
        self.num_user_messages >= self.max_num_user_messages
    }
}
