//! Markdown-flavoured plain-text rendering of a turn.

use std::fmt::{self, Write as _};

use serde_json::Value;

use crate::events::{ChatEvent, Image, Limit, SearchResults, SourceAttribution};

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "![{}]({})", self.name, self.url)
    }
}

impl fmt::Display for SourceAttribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]({})", self.display_name, self.see_more_url)?;
        if let Some(image) = self.image.as_ref().filter(|i| !i.url.is_empty()) {
            write!(f, "\n![{}]({})", self.display_name, image.url)?;
        }
        Ok(())
    }
}

impl fmt::Display for SearchResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Search Result:")?;
        match self {
            Self::Parsed(results) => {
                for (i, result) in results.iter().enumerate() {
                    let title = result.get("title").and_then(Value::as_str).unwrap_or("");
                    write!(f, "\n({}){}:\n", i + 1, title)?;
                    let snippets = result.get("snippets").and_then(Value::as_array);
                    for (j, snippet) in snippets.into_iter().flatten().enumerate() {
                        let snippet = snippet.as_str().map_or_else(|| snippet.to_string(), str::to_string);
                        writeln!(f, "[{}]:{}", j + 1, snippet)?;
                    }
                }
                writeln!(f)
            }
            Self::Raw(raw) => write!(f, "\n{raw}"),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.num_user_messages, self.max_num_user_messages)
    }
}

impl fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewChat(handle) => write!(f, "new conversation {}", handle.conversation_id),
            Self::Notice(text)
            | Self::Text(text)
            | Self::SuggestedReply(text)
            | Self::Apology(text) => f.write_str(text),
            Self::SearchResult(results) => fmt::Display::fmt(results, f),
            Self::SourceAttribution(source) => fmt::Display::fmt(source, f),
            Self::Limit(limit) => fmt::Display::fmt(limit, f),
            Self::Image(image) => fmt::Display::fmt(image, f),
            Self::TerminalResponse(_) => Ok(()),
        }
    }
}

/// Turns a turn's events into the text a terminal user reads.
///
/// Answer text streams through [`push`](Self::push) as it arrives; sources,
/// drawn images, suggestions and the message counter are collected and
/// appended by [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct PlainText {
    include_search: bool,
    sources: Vec<SourceAttribution>,
    images: Vec<Image>,
    suggestions: Vec<String>,
    limit: Option<Limit>,
}

impl PlainText {
    pub fn new(include_search: bool) -> Self {
        Self {
            include_search,
            ..Self::default()
        }
    }

    /// Text to show immediately for `event`, if any.
    pub fn push(&mut self, event: &ChatEvent) -> Option<String> {
        match event {
            ChatEvent::Text(text) => return Some(text.clone()),
            ChatEvent::Apology(text) => return Some(format!("\n{text}")),
            ChatEvent::SearchResult(results) if self.include_search => {
                return Some(results.to_string());
            }
            ChatEvent::SourceAttribution(source) => self.sources.push(source.clone()),
            ChatEvent::Image(image) => self.images.push(image.clone()),
            ChatEvent::SuggestedReply(reply) => self.suggestions.push(reply.clone()),
            ChatEvent::Limit(limit) => self.limit = Some(*limit),
            _ => {}
        }
        None
    }

    /// Trailing sections collected over the turn.
    pub fn finish(self) -> String {
        let mut out = String::new();
        section(&mut out, "See more", &self.sources, |i, s| format!("({i}):{s}"));
        section(&mut out, "Drew images", &self.images, |i, img| format!("{i}:{img}"));
        section(&mut out, "Suggest Replys", &self.suggestions, |i, r| format!("{i}:{r}"));
        if let Some(limit) = self.limit {
            let _ = write!(out, "\n\nLimit:{limit}  ");
        }
        out
    }

    /// Render a whole turn at once.
    pub fn render<'a>(events: impl IntoIterator<Item = &'a ChatEvent>, include_search: bool) -> String {
        let mut renderer = Self::new(include_search);
        let mut out = String::new();
        for event in events {
            if let Some(text) = renderer.push(event) {
                out.push_str(&text);
            }
        }
        out.push_str(&renderer.finish());
        out
    }
}

fn section<T>(out: &mut String, title: &str, items: &[T], line: impl Fn(usize, &T) -> String) {
    if items.is_empty() {
        return;
    }
    let _ = write!(out, "\n{title}:  \n");
    for (i, item) in items.iter().enumerate() {
        let _ = write!(out, "{}  \n", line(i + 1, item));
    }
}
