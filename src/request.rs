//! Composition of the application request frame (`type: 4`).
//!
//! Most of the payload is static. Only the fields that depend on
//! conversation state are computed: start-of-session flag, signature,
//! participant id and the optional personality context.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

use crate::sessions::ConversationHandle;

/// Answer tone requested from the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStyle {
    #[default]
    Creative,
    Balanced,
    Precise,
}

const COMMON_OPTIONS: &[&str] = &[
    "nlu_direct_response_filter",
    "deepleo",
    "disable_emoji_spoken_text",
    "responsible_ai_policy_235",
    "enablemm",
    "dv3sugg",
    "autosave",
    "iyxapbing",
    "iycapbing",
];

impl ConversationStyle {
    /// Option set sent as `optionsSets`.
    pub fn options(self) -> Vec<&'static str> {
        let specific: &[&str] = match self {
            Self::Creative => &[
                "h3imaginative",
                "enpcktrk",
                "logosv1",
                "udt4upm5gnd",
                "eredirecturl",
                "clgalileo",
                "gencontentv3",
            ],
            Self::Balanced => &[
                "galileo",
                "enpcktrk",
                "logosv1",
                "udt4upm5gnd",
                "eredirecturl",
                "saharagenconv5",
            ],
            Self::Precise => &[
                "h3precise",
                "enpcktrk",
                "logosv1",
                "udt4upm5gnd",
                "eredirecturl",
                "clgalileo",
                "gencontentv3",
                "gpt40613",
            ],
        };
        COMMON_OPTIONS.iter().chain(specific).copied().collect()
    }

    /// Value of the `tone` field.
    pub fn tone(self) -> &'static str {
        match self {
            Self::Creative => "Creative",
            Self::Balanced => "Balanced",
            Self::Precise => "Precise",
        }
    }
}

impl fmt::Display for ConversationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tone().to_lowercase())
    }
}

impl FromStr for ConversationStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creative" => Ok(Self::Creative),
            "balanced" => Ok(Self::Balanced),
            "precise" => Ok(Self::Precise),
            other => Err(format!("unknown conversation style: {other}")),
        }
    }
}

const ALLOWED_MESSAGE_TYPES: &[&str] = &[
    "ActionRequest",
    "Chat",
    "Context",
    "InternalSearchQuery",
    "InternalSearchResult",
    "Disengaged",
    "InternalLoaderMessage",
    "Progress",
    "RenderCardRequest",
    "AdsQuery",
    "SemanticSerp",
    "GenerateContentQuery",
    "SearchQuery",
];

const SLICE_IDS: &[&str] = &[
    "628ajcopus0",
    "scdivetr",
    "tts3cf",
    "wrapuxslimc",
    "gaincrrev",
    "kcimgov2cf",
    "0731ziv2s0",
    "707enpcktrk",
    "0518logos",
    "0510wow",
    "wowcds",
    "727udtupm",
    "815enftshrcs0",
];

/// Inputs of one request frame.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub prompt: &'a str,
    pub handle: &'a ConversationHandle,
    pub style: ConversationStyle,
    pub locale: &'a str,
    pub client_id: &'a str,
    pub invocation_id: u32,
    /// Extra instructions injected on the first turn only.
    pub personality: Option<&'a str>,
    /// Address echoed in `userIpAddress`.
    pub forwarded_ip: &'a str,
    /// Blob URL of an uploaded image attachment.
    pub image_url: Option<&'a str>,
}

/// Build the `type: 4` request frame.
pub fn build_chat_request(req: &ChatRequest<'_>) -> Value {
    let is_start = req.handle.is_start_of_conversation();
    let message_id = uuid::Uuid::new_v4().to_string();
    let locale = req.locale;
    let region = locale
        .get(locale.len().saturating_sub(2)..)
        .unwrap_or_default()
        .to_uppercase();

    let mut arguments = json!({
        "source": "cib",
        "optionsSets": req.style.options(),
        "allowedMessageTypes": ALLOWED_MESSAGE_TYPES,
        "sliceIds": SLICE_IDS,
        "verbosity": "verbose",
        "scenario": "SERP",
        "plugins": [],
        "traceId": random_hex(32),
        "isStartOfSession": is_start,
        "requestId": message_id,
        "message": {
            "locale": locale,
            "market": locale,
            "region": region,
            "location": "lat:47.639557;long:-122.128159;re=1000m;",
            "locationHints": location_hints(locale),
            "userIpAddress": req.forwarded_ip,
            "timestamp": chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
            "author": "user",
            "inputMethod": "Keyboard",
            "text": req.prompt,
            "messageType": "Chat",
            "messageId": message_id,
            "requestId": message_id,
        },
        "tone": req.style.tone(),
        "spokenTextMode": "None",
        "conversationId": req.handle.conversation_id,
        "participant": {"id": req.client_id},
    });

    if let Some(signature) = req.handle.conversation_signature.as_deref() {
        arguments["conversationSignature"] = json!(signature);
    }
    if let Some(image_url) = req.image_url {
        arguments["message"]["imageUrl"] = json!(image_url);
        arguments["message"]["originalImageUrl"] = json!(image_url);
    }
    if let Some(personality) = req.personality.filter(|_| is_start) {
        arguments["previousMessages"] = json!([{
            "author": "user",
            "description": format!("[system](#additional_instructions)\n{personality}\n\n"),
            "contextType": "WebPage",
            "messageType": "Context",
            "messageId": "discover-web--page-ping-mriduna-----",
        }]);
    }

    json!({
        "arguments": [arguments],
        "invocationId": req.invocation_id.to_string(),
        "target": "chat",
        "type": 4,
    })
}

fn random_hex(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

fn location_hints(locale: &str) -> Value {
    let (country, state, city, offset, lat, long) = match locale.to_lowercase().as_str() {
        "en-gb" => ("United Kingdom", "", "London", 0, 51.5074, -0.1278),
        "en-ie" => ("Norway", "", "Oslo", 1, 59.9139, 10.7522),
        "zh-cn" => ("China", "", "Beijing", 8, 39.9042, 116.4074),
        _ => (
            "United States",
            "California",
            "Los Angeles",
            8,
            34.0536909,
            -118.242766,
        ),
    };
    json!([{
        "country": country,
        "state": state,
        "city": city,
        "timezoneoffset": offset,
        "countryConfidence": 8,
        "Center": {"Latitude": lat, "Longitude": long},
        "RegionType": 2,
        "SourceType": 1,
    }])
}
