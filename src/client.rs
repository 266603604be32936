//! The public entry point tying the components together.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::bootstrap::ConnectionBootstrap;
use crate::config::ClientConfig;
use crate::conversations::{Conversations, DeleteSelection};
use crate::engine::{ConversationEngine, TurnRequest};
use crate::error::Result;
use crate::events::ChatEvent;
use crate::headers;
use crate::imagegen::{DrawOutcome, DrawTransport, HttpDrawTransport, ImageGenerator};
use crate::render::PlainText;
use crate::sessions::{ConversationHandle, SessionStore};

/// Capacity of a turn's event channel.
const EVENT_BUFFER: usize = 64;

struct Inner {
    config: ClientConfig,
    bootstrap: Arc<ConnectionBootstrap>,
    engine: ConversationEngine,
    conversations: Conversations,
    images: ImageGenerator,
}

/// Client for the chat service. Cheap to clone; clones share the
/// conversation store.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let forwarded_ip = headers::forwarded_ip();
        let transport = Arc::new(HttpDrawTransport::new(&config, &forwarded_ip)?);
        Self::build(config, transport, forwarded_ip)
    }

    /// A client whose image generation goes through `transport`.
    pub fn with_draw_transport(
        config: ClientConfig,
        transport: Arc<dyn DrawTransport>,
    ) -> Result<Self> {
        Self::build(config, transport, headers::forwarded_ip())
    }

    fn build(
        config: ClientConfig,
        transport: Arc<dyn DrawTransport>,
        forwarded_ip: String,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SessionStore::new());
        let bootstrap = Arc::new(ConnectionBootstrap::new(&config, store, &forwarded_ip)?);
        let images = ImageGenerator::new(transport, &config);
        let engine = ConversationEngine::new(&config, bootstrap.clone(), images.clone(), &forwarded_ip);
        let conversations = Conversations::new(&config, bootstrap.clone(), &forwarded_ip)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                bootstrap,
                engine,
                conversations,
                images,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        self.inner.bootstrap.store()
    }

    /// Load the account's conversations and their tokens.
    pub async fn init(&self) -> Result<()> {
        info!("initializing client");
        self.list_conversations().await?;
        self.load_all(false).await?;
        info!(conversations = self.store().len(), "client ready");
        Ok(())
    }

    pub async fn create_conversation(&self) -> Result<ConversationHandle> {
        self.inner.bootstrap.create_conversation().await
    }

    /// A turn request using the configured conversation style.
    pub fn turn(&self, prompt: impl Into<String>) -> TurnRequest {
        TurnRequest::new(prompt).with_style(self.inner.config.style)
    }

    /// Start a turn and return its event stream.
    ///
    /// A failed turn ends the stream with one `Err`. Without a handle a new
    /// conversation is created and announced with `NewChat`.
    pub fn ask_stream(
        &self,
        handle: Option<ConversationHandle>,
        turn: TurnRequest,
    ) -> mpsc::Receiver<Result<ChatEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.engine.run_turn(handle, &turn, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    /// Run a turn to completion and collect its events.
    pub async fn ask(
        &self,
        handle: Option<ConversationHandle>,
        turn: TurnRequest,
    ) -> Result<Vec<ChatEvent>> {
        let mut rx = self.ask_stream(handle, turn);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event?);
        }
        Ok(events)
    }

    /// Run a turn and render it as plain text.
    pub async fn ask_text(
        &self,
        handle: Option<ConversationHandle>,
        turn: TurnRequest,
        include_search: bool,
    ) -> Result<String> {
        let events = self.ask(handle, turn).await?;
        Ok(PlainText::render(&events, include_search))
    }

    /// Generate images outside of a conversation.
    pub async fn draw(&self, prompt: &str) -> DrawOutcome {
        self.inner.images.generate(prompt).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationHandle>> {
        self.inner.conversations.list().await
    }

    pub async fn fetch_history(&self, id: &str) -> Result<Vec<Value>> {
        self.inner.conversations.fetch_history(id).await
    }

    pub async fn load_all(&self, load_history: bool) -> Result<()> {
        self.inner.conversations.load_all(load_history).await
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.inner.conversations.delete(id).await
    }

    /// Delete several conversations; returns how many were removed.
    pub async fn delete_conversations(&self, selection: DeleteSelection) -> usize {
        self.inner.conversations.delete_many(selection).await
    }
}
