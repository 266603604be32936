//! Frame classification for one conversation turn.
//!
//! The service re-sends the *whole* answer text in every update frame. The
//! classifier keeps a [`TurnCursor`] with what it already emitted and turns
//! each frame into the new suffix only, so callers see a monotonic stream of
//! deltas. The classifier does no I/O: it reports image prompts to launch,
//! control frames to answer, and whether the turn is over, and leaves the
//! acting to the engine.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::ControlFrame;
use crate::error::ChatError;
use crate::events::{ChatEvent, Image, Limit, SearchResults, SourceAttribution};

/// Apology sent when the conversation has used all of its messages.
pub const EXHAUSTED_APOLOGY: &str =
    "The number of chats has reached the maximum, please open a new conversation";

/// Characters that may end a footnote marker still being streamed.
const FOOTNOTE_TAIL: &[char] = &[
    '[', ']', '(', ')', '^', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// What the classifier has already emitted during the current turn.
#[derive(Debug, Default, Clone)]
pub struct TurnCursor {
    pub last_plain_text: String,
    pub last_apology_text: String,
    pub seen_attributions: HashSet<(String, String)>,
}

/// How a frame affects the turn.
#[derive(Debug, Default)]
pub enum TurnSignal {
    #[default]
    Continue,
    /// Terminal frame without error. Carries the whole frame.
    Completed(Value),
    /// Throttling counters ran out; the socket must be closed.
    Exhausted,
    /// Terminal frame carrying an error.
    Failed(ChatError),
}

/// Result of classifying one frame.
#[derive(Debug, Default)]
pub struct Step {
    pub events: Vec<ChatEvent>,
    /// Prompts of image generation requests to launch in the background.
    pub image_prompts: Vec<String>,
    /// Control frame to send back.
    pub reply: Option<ControlFrame>,
    pub signal: TurnSignal,
}

#[derive(Debug, Default)]
pub struct EventClassifier {
    cursor: TurnCursor,
}

impl EventClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> &TurnCursor {
        &self.cursor
    }

    /// Classify one decoded frame.
    pub fn classify(&mut self, frame: &Value) -> Step {
        let mut step = Step::default();
        match frame.get("type").and_then(Value::as_i64) {
            Some(1) => self.classify_update(frame, &mut step),
            Some(2) => classify_terminal(frame, &mut step),
            Some(6) => step.reply = Some(ControlFrame::Ping),
            Some(7) => step.reply = Some(ControlFrame::Ack),
            other => debug!(frame_type = ?other, "ignoring frame"),
        }
        step
    }

    fn classify_update(&mut self, frame: &Value, step: &mut Step) {
        let Some(arguments) = frame.get("arguments").and_then(|a| a.get(0)) else {
            return;
        };

        if let Some(messages) = bot_messages(arguments) {
            for message in messages {
                self.classify_message(message, step);
            }
            return;
        }

        let Some(throttling) = arguments
            .get("throttling")
            .filter(|t| t.as_object().is_some_and(|o| !o.is_empty()))
        else {
            return;
        };
        match serde_json::from_value::<Limit>(throttling.clone()) {
            Ok(limit) => {
                step.events.push(ChatEvent::Limit(limit));
                if limit.is_exhausted() {
                    step.events
                        .push(ChatEvent::Apology(EXHAUSTED_APOLOGY.to_string()));
                    step.signal = TurnSignal::Exhausted;
                }
            }
            Err(e) => warn!(error = %e, "malformed throttling payload"),
        }
    }

    fn classify_message(&mut self, message: &Value, step: &mut Step) {
        let message_type = message.get("messageType").and_then(Value::as_str);
        let text = message.get("text").and_then(Value::as_str).unwrap_or("");

        match message_type {
            Some("GenerateContentQuery") => {
                step.image_prompts.push(text.to_string());
            }
            Some("InternalLoaderMessage") => {
                step.events.push(ChatEvent::Notice(text.to_string()));
            }
            Some("InternalSearchResult") => {
                step.events
                    .push(ChatEvent::SearchResult(parse_search_results(message)));
            }
            _ if message.get("contentOrigin").and_then(Value::as_str) == Some("Apology") => {
                let delta = suffix_after(text, &self.cursor.last_apology_text);
                self.cursor.last_apology_text = text.to_string();
                if !delta.is_empty() {
                    step.events.push(ChatEvent::Apology(delta));
                }
            }
            None => self.classify_prose(message, text, step),
            Some(other) => debug!(message_type = other, "ignoring message"),
        }
    }

    fn classify_prose(&mut self, message: &Value, text: &str, step: &mut Step) {
        // A marker such as "[^1^]" is still arriving; wait for the next frame.
        if ends_with_footnote_fragment(text) {
            return;
        }

        let normalized = normalize_footnotes(text);
        let delta = suffix_after(&normalized, &self.cursor.last_plain_text);
        self.cursor.last_plain_text = normalized;
        if !delta.is_empty() {
            step.events.push(ChatEvent::Text(delta));
        }

        if let Some(attributions) = message.get("sourceAttributions").and_then(Value::as_array) {
            for raw in attributions {
                let attribution = source_attribution(raw);
                if self.cursor.seen_attributions.insert(attribution.key()) {
                    step.events.push(ChatEvent::SourceAttribution(attribution));
                }
            }
        }

        if let Some(suggestions) = message.get("suggestedResponses").and_then(Value::as_array) {
            step.events.extend(
                suggestions
                    .iter()
                    .filter_map(|s| s.get("text").and_then(Value::as_str))
                    .filter(|s| !s.is_empty())
                    .map(|s| ChatEvent::SuggestedReply(s.to_string())),
            );
        }
    }
}

fn classify_terminal(frame: &Value, step: &mut Step) {
    let result = frame.get("item").and_then(|i| i.get("result"));
    if let Some(result) = result.filter(|r| r.get("error").is_some_and(is_truthy)) {
        step.signal = TurnSignal::Failed(ChatError::Remote {
            value: string_field(result, "value"),
            message: string_field(result, "message"),
        });
        return;
    }
    step.signal = TurnSignal::Completed(frame.clone());
}

/// Message records carried by a terminal frame.
pub fn terminal_messages(frame: &Value) -> Vec<Value> {
    frame
        .get("item")
        .and_then(|i| i.get("messages"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Messages of an update frame, when the batch was written by the bot.
fn bot_messages(arguments: &Value) -> Option<&Vec<Value>> {
    let messages = arguments.get("messages")?.as_array()?;
    let author = messages.first()?.get("author").and_then(Value::as_str);
    (author == Some("bot")).then_some(messages)
}

fn parse_search_results(message: &Value) -> SearchResults {
    let payload = match message.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => message
            .get("hiddenText")
            .and_then(Value::as_str)
            .unwrap_or("")
            .replace("```json", "")
            .replace("\n```", ""),
    };

    match serde_json::from_str::<Value>(&payload) {
        Ok(Value::Object(map)) => match map.get("web_search_results") {
            Some(Value::Array(results)) => SearchResults::Parsed(results.clone()),
            _ => SearchResults::Parsed(Vec::new()),
        },
        Ok(_) | Err(_) => SearchResults::Raw(payload),
    }
}

fn source_attribution(raw: &Value) -> SourceAttribution {
    let see_more_url = raw
        .get("seeMoreUrl")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let display_name = raw
        .get("providerDisplayName")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| see_more_url.clone());

    let link = raw
        .get("imageLink")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let favicon = raw
        .get("imageFavicon")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let image = (link.is_some() || favicon.is_some()).then(|| Image {
        name: "image.png".to_string(),
        url: link.unwrap_or("").to_string(),
        base64: favicon.map(str::to_string),
    });

    SourceAttribution {
        display_name,
        see_more_url,
        image,
    }
}

/// Whether `text` ends with a character that may belong to an unfinished
/// footnote marker.
pub fn ends_with_footnote_fragment(text: &str) -> bool {
    text.ends_with(FOOTNOTE_TAIL)
}

/// Collapse `[^`, `^]`, `(^` and `^)` to plain brackets.
pub fn normalize_footnotes(text: &str) -> String {
    text.replace("[^", "[")
        .replace("^]", "]")
        .replace("(^", "(")
        .replace("^)", ")")
}

/// Part of `full` past the first `prev.chars().count()` characters.
fn suffix_after(full: &str, prev: &str) -> String {
    full.chars().skip(prev.chars().count()).collect()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn string_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bot_update(messages: Value) -> Value {
        json!({"type": 1, "target": "update", "arguments": [{"messages": messages}]})
    }

    fn prose(text: &str) -> Value {
        bot_update(json!([{"author": "bot", "text": text}]))
    }

    fn texts(events: &[ChatEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn text_deltas_concatenate_to_full_text() {
        let mut classifier = EventClassifier::new();
        let mut emitted = Vec::new();
        for full in ["Hel", "Hello", "Hello", "Hello, wor", "Hello, world."] {
            emitted.extend(texts(&classifier.classify(&prose(full)).events));
        }
        assert_eq!(emitted, vec!["Hel", "lo", ", wor", "ld."]);
        assert_eq!(emitted.concat(), "Hello, world.");
    }

    #[test]
    fn unfinished_footnote_marker_is_held_back() {
        let mut classifier = EventClassifier::new();
        let mut emitted = Vec::new();
        for full in [
            "Rust is fast",
            "Rust is fast[^",
            "Rust is fast[^1",
            "Rust is fast[^1^]",
            "Rust is fast[^1^] and safe.",
        ] {
            emitted.extend(texts(&classifier.classify(&prose(full)).events));
        }
        assert_eq!(emitted, vec!["Rust is fast", "[1] and safe."]);
        assert_eq!(emitted.concat(), "Rust is fast[1] and safe.");
    }

    #[test]
    fn suppressed_frame_skips_attributions_too() {
        let mut classifier = EventClassifier::new();
        let frame = bot_update(json!([{
            "author": "bot",
            "text": "See [^1",
            "sourceAttributions": [{"providerDisplayName": "Docs", "seeMoreUrl": "https://a"}]
        }]));
        assert!(classifier.classify(&frame).events.is_empty());
    }

    #[test]
    fn footnote_normalization_is_idempotent() {
        let once = normalize_footnotes("a[^1^] b(^2^) c");
        assert_eq!(once, "a[1] b(2) c");
        assert_eq!(normalize_footnotes(&once), once);
    }

    #[test]
    fn deltas_count_characters_not_bytes() {
        let mut classifier = EventClassifier::new();
        classifier.classify(&prose("héllo"));
        let step = classifier.classify(&prose("héllo wörld."));
        assert_eq!(texts(&step.events), vec![" wörld."]);
    }

    #[test]
    fn null_message_type_is_plain_prose() {
        let mut classifier = EventClassifier::new();
        let frame = bot_update(json!([{"author": "bot", "text": "Hello", "messageType": null}]));
        assert_eq!(texts(&classifier.classify(&frame).events), vec!["Hello"]);
    }

    #[test]
    fn attributions_are_emitted_once_per_turn() {
        let mut classifier = EventClassifier::new();
        let attributions = json!([
            {"providerDisplayName": "Rust", "seeMoreUrl": "https://rust-lang.org"},
            {"seeMoreUrl": "https://docs.rs"}
        ]);
        let frame = bot_update(json!([{
            "author": "bot", "text": "Answer.", "sourceAttributions": attributions
        }]));

        let first = classifier.classify(&frame).events;
        let sources: Vec<_> = first
            .iter()
            .filter_map(|e| match e {
                ChatEvent::SourceAttribution(sa) => Some(sa.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].display_name, "Rust");
        assert_eq!(sources[1].display_name, "https://docs.rs");
        assert!(sources[1].image.is_none());

        let again = classifier.classify(&frame).events;
        assert!(
            !again
                .iter()
                .any(|e| matches!(e, ChatEvent::SourceAttribution(_)))
        );
        assert_eq!(classifier.cursor().seen_attributions.len(), 2);
    }

    #[test]
    fn suggestions_skip_empty_text() {
        let mut classifier = EventClassifier::new();
        let frame = bot_update(json!([{
            "author": "bot",
            "text": "Done.",
            "suggestedResponses": [{"text": "Tell me more"}, {"text": ""}, {}]
        }]));
        let events = classifier.classify(&frame).events;
        assert_eq!(
            events,
            vec![
                ChatEvent::Text("Done.".into()),
                ChatEvent::SuggestedReply("Tell me more".into())
            ]
        );
    }

    #[test]
    fn apology_is_incremental() {
        let mut classifier = EventClassifier::new();
        let apology = |text: &str| {
            bot_update(json!([{"author": "bot", "text": text, "contentOrigin": "Apology"}]))
        };
        let a = classifier.classify(&apology("Sorry")).events;
        let b = classifier.classify(&apology("Sorry, I can't")).events;
        let c = classifier.classify(&apology("Sorry, I can't")).events;
        assert_eq!(a, vec![ChatEvent::Apology("Sorry".into())]);
        assert_eq!(b, vec![ChatEvent::Apology(", I can't".into())]);
        assert!(c.is_empty());
    }

    #[test]
    fn loader_and_generate_content_messages() {
        let mut classifier = EventClassifier::new();
        let frame = bot_update(json!([
            {"author": "bot", "text": "Searching the web for: `rust`", "messageType": "InternalLoaderMessage"},
            {"author": "bot", "text": "a red crab", "messageType": "GenerateContentQuery", "contentOrigin": "DeepLeo"}
        ]));
        let step = classifier.classify(&frame);
        assert_eq!(
            step.events,
            vec![ChatEvent::Notice("Searching the web for: `rust`".into())]
        );
        assert_eq!(step.image_prompts, vec!["a red crab".to_string()]);
    }

    #[test]
    fn search_results_parse_or_degrade() {
        let mut classifier = EventClassifier::new();
        let parsed = bot_update(json!([{
            "author": "bot",
            "messageType": "InternalSearchResult",
            "text": "{\"web_search_results\":[{\"title\":\"Rust\",\"snippets\":[\"fast\"]}]}"
        }]));
        match &classifier.classify(&parsed).events[..] {
            [ChatEvent::SearchResult(SearchResults::Parsed(list))] => {
                assert_eq!(list[0]["title"], "Rust")
            }
            other => panic!("unexpected events: {other:?}"),
        }

        let hidden = bot_update(json!([{
            "author": "bot",
            "messageType": "InternalSearchResult",
            "hiddenText": "```json\n{\"web_search_results\":[]}\n```"
        }]));
        assert_eq!(
            classifier.classify(&hidden).events,
            vec![ChatEvent::SearchResult(SearchResults::Parsed(vec![]))]
        );

        let raw = bot_update(json!([{
            "author": "bot", "messageType": "InternalSearchResult", "text": "not json"
        }]));
        assert_eq!(
            classifier.classify(&raw).events,
            vec![ChatEvent::SearchResult(SearchResults::Raw("not json".into()))]
        );
    }

    #[test]
    fn user_batches_are_ignored() {
        let mut classifier = EventClassifier::new();
        let frame = bot_update(json!([{"author": "user", "text": "hi"}]));
        let step = classifier.classify(&frame);
        assert!(step.events.is_empty());
        assert!(matches!(step.signal, TurnSignal::Continue));
    }

    #[test]
    fn throttling_reports_limit() {
        let mut classifier = EventClassifier::new();
        let frame = json!({"type": 1, "arguments": [{"throttling": {
            "maxNumUserMessagesInConversation": 30,
            "numUserMessagesInConversation": 2,
            "maxNumLongDocSummaryUserMessagesInConversation": 5,
            "numLongDocSummaryUserMessagesInConversation": 0
        }}]});
        let step = classifier.classify(&frame);
        assert_eq!(step.events.len(), 1);
        assert!(matches!(step.events[0], ChatEvent::Limit(l) if l.num_user_messages == 2));
        assert!(matches!(step.signal, TurnSignal::Continue));
    }

    #[test]
    fn throttling_at_maximum_exhausts_turn() {
        let mut classifier = EventClassifier::new();
        let frame = json!({"type": 1, "arguments": [{"throttling": {
            "maxNumUserMessagesInConversation": 30,
            "numUserMessagesInConversation": 30
        }}]});
        let step = classifier.classify(&frame);
        let limits = step
            .events
            .iter()
            .filter(|e| matches!(e, ChatEvent::Limit(_)))
            .count();
        let apologies = step
            .events
            .iter()
            .filter(|e| matches!(e, ChatEvent::Apology(a) if a == EXHAUSTED_APOLOGY))
            .count();
        assert_eq!((limits, apologies), (1, 1));
        assert!(matches!(step.signal, TurnSignal::Exhausted));
    }

    #[test]
    fn terminal_frame_completes_turn() {
        let mut classifier = EventClassifier::new();
        let frame = json!({"type": 2, "item": {
            "messages": [{"author": "user", "text": "hi"}, {"author": "bot", "text": "Hello"}],
            "result": {"value": "Success"}
        }});
        let step = classifier.classify(&frame);
        assert!(step.events.is_empty());
        match step.signal {
            TurnSignal::Completed(payload) => {
                assert_eq!(terminal_messages(&payload).len(), 2)
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn terminal_error_fails_turn() {
        let mut classifier = EventClassifier::new();
        let frame = json!({"type": 2, "item": {"result": {
            "value": "InvalidSession", "message": "Session expired", "error": "Session expired"
        }}});
        match classifier.classify(&frame).signal {
            TurnSignal::Failed(ChatError::Remote { value, message }) => {
                assert_eq!(value, "InvalidSession");
                assert_eq!(message, "Session expired");
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn keep_alive_frames_request_replies() {
        let mut classifier = EventClassifier::new();
        assert_eq!(
            classifier.classify(&json!({"type": 6})).reply,
            Some(ControlFrame::Ping)
        );
        assert_eq!(
            classifier.classify(&json!({"type": 7})).reply,
            Some(ControlFrame::Ack)
        );
        assert!(classifier.classify(&json!({"type": 3})).reply.is_none());
    }
}
