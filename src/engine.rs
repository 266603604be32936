//! One conversation turn over the chat hub socket.
//!
//! The engine resolves the conversation, opens the socket, performs the
//! handshake, sends the request frame and then runs a single `select!` loop
//! over three sources: the keep-alive ticker, an idle deadline and the
//! socket stream. Decoded frames go through the [`EventClassifier`]; image
//! prompts it reports run as background tasks whose results are merged into
//! the event stream on the next loop iteration and drained before the turn
//! ends. The socket is always closed before an outcome is reported.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use crate::bootstrap::ConnectionBootstrap;
use crate::classifier::{EventClassifier, TurnSignal, terminal_messages};
use crate::codec::{self, ControlFrame};
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::events::ChatEvent;
use crate::headers::{self, HeaderSet};
use crate::imagegen::{DrawOutcome, ImageGenerator};
use crate::request::{ChatRequest, ConversationStyle, build_chat_request};
use crate::sessions::ConversationHandle;

/// Sending half of a turn's event stream.
pub type EventSender = mpsc::Sender<Result<ChatEvent>>;

/// What the caller asks in one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub prompt: String,
    pub style: ConversationStyle,
    /// Instructions injected as context on the first turn of a conversation.
    pub personality: Option<String>,
    /// Base64-encoded image attached to the prompt. Uploaded before the
    /// socket opens; compressing it is up to the caller.
    pub image: Option<String>,
}

impl TurnRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_style(mut self, style: ConversationStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = Some(personality.into());
        self
    }

    pub fn with_image(mut self, image_base64: impl Into<String>) -> Self {
        self.image = Some(image_base64.into());
        self
    }
}

/// Timing knobs of the receive loop.
#[derive(Debug, Clone, Copy)]
struct LoopTimings {
    receive_timeout: Duration,
    heartbeat: Duration,
    max_empty_receives: u32,
}

/// How the receive loop ended without a fatal error.
enum TurnEnd {
    Completed(serde_json::Value),
    Exhausted,
    Closed,
}

pub struct ConversationEngine {
    bootstrap: Arc<ConnectionBootstrap>,
    images: ImageGenerator,
    locale: String,
    forwarded_ip: String,
    socket_headers: Vec<(&'static str, String)>,
    timings: LoopTimings,
    /// Request frames sent by this engine, used as the invocation id.
    sent: AtomicU32,
}

impl ConversationEngine {
    pub fn new(
        config: &ClientConfig,
        bootstrap: Arc<ConnectionBootstrap>,
        images: ImageGenerator,
        forwarded_ip: &str,
    ) -> Self {
        Self {
            bootstrap,
            images,
            locale: config.locale.clone(),
            forwarded_ip: forwarded_ip.to_string(),
            socket_headers: headers::header_pairs(HeaderSet::Socket, config, forwarded_ip),
            timings: LoopTimings {
                receive_timeout: config.receive_timeout(),
                heartbeat: config.heartbeat_interval(),
                max_empty_receives: config.max_empty_receives.max(1),
            },
            sent: AtomicU32::new(0),
        }
    }

    /// Run one turn, sending its events to `events`.
    ///
    /// Without a handle a new conversation is created first and announced
    /// with a `NewChat` event. A successful turn ends with exactly one
    /// `TerminalResponse`; a failed one returns the error instead.
    pub async fn run_turn(
        &self,
        handle: Option<ConversationHandle>,
        turn: &TurnRequest,
        events: &EventSender,
    ) -> Result<()> {
        let handle = match handle {
            Some(handle) => handle,
            None => {
                let created = self.bootstrap.create_conversation().await?;
                emit(events, ChatEvent::NewChat(created.clone())).await;
                created
            }
        };
        let handle = self.bootstrap.ensure_fresh(&handle).await?;
        let id = handle.conversation_id.clone();
        let image_url = match &turn.image {
            Some(image) => self.bootstrap.upload_image(&handle, turn.style, image).await?,
            None => None,
        };

        let mut request = self.bootstrap.socket_url(&handle).into_client_request()?;
        for (name, value) in &self.socket_headers {
            let value = HeaderValue::from_str(value)
                .map_err(|e| ChatError::Config(format!("invalid value for header {name}: {e}")))?;
            request.headers_mut().insert(*name, value);
        }

        info!(conversation_id = %id, "opening chat hub socket");
        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let invocation_id = self.sent.fetch_add(1, Ordering::Relaxed);
        let client_id = self.bootstrap.store().client_id();
        let frame = build_chat_request(&ChatRequest {
            prompt: &turn.prompt,
            handle: &handle,
            style: turn.style,
            locale: &self.locale,
            client_id: &client_id,
            invocation_id,
            personality: turn.personality.as_deref(),
            forwarded_ip: &self.forwarded_ip,
            image_url: image_url.as_deref(),
        });

        let mut tasks = ImageTasks::default();
        let outcome = async {
            sink.send(text(ControlFrame::Handshake.encode())).await?;
            match tokio::time::timeout(self.timings.receive_timeout, stream.next()).await {
                Err(_) => return Err(ChatError::ProtocolTimeout),
                Ok(None) => return Ok(TurnEnd::Closed),
                Ok(Some(reply)) => {
                    let reply = reply?;
                    debug!(?reply, "handshake acknowledged");
                }
            }
            sink.send(text(ControlFrame::Ping.encode())).await?;
            sink.send(text(codec::encode(&frame)?)).await?;

            self.receive_loop(&mut sink, &mut stream, &mut tasks, events)
                .await
        }
        .await;

        if let Err(e) = sink.close().await {
            debug!(error = %e, "socket close failed");
        }
        debug!(conversation_id = %id, "chat hub socket closed");

        match outcome {
            Ok(TurnEnd::Completed(frame)) => {
                self.bootstrap
                    .store()
                    .append_history(&id, terminal_messages(&frame));
                tasks.drain(events).await;
                info!(conversation_id = %id, "turn completed");
                emit(events, ChatEvent::TerminalResponse(frame)).await;
                Ok(())
            }
            Ok(TurnEnd::Exhausted) => {
                tasks.drain(events).await;
                info!(conversation_id = %id, "conversation exhausted");
                Ok(())
            }
            Ok(TurnEnd::Closed) => {
                tasks.drain(events).await;
                warn!(conversation_id = %id, "socket closed before the terminal frame");
                Err(ChatError::ConnectionClosed)
            }
            Err(e) => {
                tasks.abort();
                warn!(conversation_id = %id, error = %e, "turn failed");
                Err(e)
            }
        }
    }

    async fn receive_loop<S, R>(
        &self,
        sink: &mut S,
        stream: &mut R,
        tasks: &mut ImageTasks,
        events: &EventSender,
    ) -> Result<TurnEnd>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let timings = self.timings;
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + timings.heartbeat, timings.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle = tokio::time::sleep(timings.receive_timeout);
        tokio::pin!(idle);

        let mut empty_budget = timings.max_empty_receives;
        let mut classifier = EventClassifier::new();

        loop {
            tasks.flush_finished(events).await;

            let payload = tokio::select! {
                _ = heartbeat.tick() => {
                    sink.send(text(ControlFrame::Ping.encode())).await?;
                    continue;
                }
                _ = &mut idle => None,
                message = stream.next() => match message {
                    None | Some(Ok(Message::Close(_))) => return Ok(TurnEnd::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(payload))) => Some(payload),
                    Some(Ok(_)) => {
                        idle.as_mut().reset(Instant::now() + timings.receive_timeout);
                        continue;
                    }
                },
            };
            idle.as_mut()
                .reset(Instant::now() + timings.receive_timeout);

            let Some(payload) = payload.filter(|p| !p.as_str().is_empty()) else {
                empty_budget -= 1;
                debug!(remaining = empty_budget, "empty receive");
                if empty_budget == 0 {
                    return Err(ChatError::ProtocolTimeout);
                }
                continue;
            };

            for frame in codec::decode(payload.as_str())? {
                let step = classifier.classify(&frame);
                if let Some(reply) = step.reply {
                    sink.send(text(reply.encode())).await?;
                }
                for event in step.events {
                    emit(events, event).await;
                }
                for prompt in step.image_prompts {
                    tasks.spawn(&self.images, prompt);
                }
                match step.signal {
                    TurnSignal::Continue => {}
                    TurnSignal::Completed(frame) => return Ok(TurnEnd::Completed(frame)),
                    TurnSignal::Exhausted => return Ok(TurnEnd::Exhausted),
                    TurnSignal::Failed(e) => return Err(e),
                }
            }
        }
    }
}

fn text(payload: String) -> Message {
    Message::Text(payload.into())
}

async fn emit(events: &EventSender, event: ChatEvent) {
    if events.send(Ok(event)).await.is_err() {
        debug!("event receiver dropped");
    }
}

/// Image generations running alongside the receive loop.
///
/// Dropping the set aborts whatever is still running.
#[derive(Default)]
struct ImageTasks {
    pending: Vec<JoinHandle<DrawOutcome>>,
}

impl ImageTasks {
    fn spawn(&mut self, generator: &ImageGenerator, prompt: String) {
        let generator = generator.clone();
        self.pending
            .push(tokio::spawn(async move { generator.generate(&prompt).await }));
    }

    /// Emit the results of finished generations without waiting.
    async fn flush_finished(&mut self, events: &EventSender) {
        if self.pending.is_empty() {
            return;
        }
        let (finished, pending): (Vec<_>, Vec<_>) = mem::take(&mut self.pending)
            .into_iter()
            .partition(JoinHandle::is_finished);
        self.pending = pending;
        for handle in finished {
            Self::forward(handle, events).await;
        }
    }

    /// Wait for every outstanding generation and emit its results.
    async fn drain(&mut self, events: &EventSender) {
        for handle in mem::take(&mut self.pending) {
            Self::forward(handle, events).await;
        }
    }

    fn abort(&mut self) {
        for handle in self.pending.drain(..) {
            handle.abort();
        }
    }

    async fn forward(handle: JoinHandle<DrawOutcome>, events: &EventSender) {
        match handle.await {
            Ok(outcome) => {
                for event in outcome.into_events() {
                    emit(events, event).await;
                }
            }
            Err(e) => warn!(error = %e, "image task did not complete"),
        }
    }
}

impl Drop for ImageTasks {
    fn drop(&mut self) {
        self.abort();
    }
}
