//! Proposed operations and their typed interpretation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A side-effecting action proposed by the decision process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedOperation {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// What kind of capability a tool is. Declared by the caller per tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Sends text to a user or channel.
    Message,
    Search,
    /// Browser navigation to a page.
    Navigate,
    /// Looking at the current page (screenshot, DOM snapshot).
    Inspect,
    /// Pulling content out of the current page.
    Extract,
    /// Status and listing calls about the agent's own work.
    Orchestration,
    /// Produces an artifact (image, document).
    Generate,
    Other,
}

/// Typed view of an operation under its declared kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Message {
        recipient: Option<String>,
        text: String,
    },
    Search {
        query: String,
    },
    Navigate {
        target: String,
    },
    Inspect,
    Extract,
    Orchestration,
    Generate {
        prompt: String,
    },
    Other,
}

const TEXT_KEYS: &[&str] = &["text", "message", "content", "body"];
const RECIPIENT_KEYS: &[&str] = &[
    "recipient",
    "chat_id",
    "chatId",
    "channel_id",
    "channelId",
    "to",
    "destination",
];
const QUERY_KEYS: &[&str] = &["query", "q", "search", "search_term"];
const TARGET_KEYS: &[&str] = &["url", "target", "href", "page"];
const PROMPT_KEYS: &[&str] = &["prompt", "description", "subject"];

impl ProposedOperation {
    /// Build from a name and a JSON object. Non-object args become empty.
    pub fn new(name: &str, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.to_string(),
            args,
        }
    }

    /// First present argument among `keys`, rendered as a string.
    pub fn arg_string(&self, keys: &[&str]) -> Option<String> {
        arg_string(&self.args, keys)
    }

    /// Name plus canonical (key-sorted) arguments. Identical calls share it.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.name, canonical_json(&Value::Object(self.args.clone())))
    }

    pub fn intent(&self, kind: ToolKind) -> Intent {
        intent_of(&self.args, kind)
    }
}

pub(crate) fn intent_of(args: &Map<String, Value>, kind: ToolKind) -> Intent {
    match kind {
        ToolKind::Message => Intent::Message {
            recipient: arg_string(args, RECIPIENT_KEYS),
            text: arg_string(args, TEXT_KEYS).unwrap_or_default(),
        },
        ToolKind::Search => Intent::Search {
            query: arg_string(args, QUERY_KEYS).unwrap_or_default(),
        },
        ToolKind::Navigate => Intent::Navigate {
            target: arg_string(args, TARGET_KEYS).unwrap_or_default(),
        },
        ToolKind::Inspect => Intent::Inspect,
        ToolKind::Extract => Intent::Extract,
        ToolKind::Orchestration => Intent::Orchestration,
        ToolKind::Generate => Intent::Generate {
            prompt: arg_string(args, PROMPT_KEYS).unwrap_or_default(),
        },
        ToolKind::Other => Intent::Other,
    }
}

fn arg_string(args: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match args.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Comparable form of a navigation target: no scheme, `www.`, fragment or
/// trailing slash.
pub fn normalize_target(target: &str) -> String {
    let mut t = target.trim().to_lowercase();
    if let Some(idx) = t.find('#') {
        t.truncate(idx);
    }
    for scheme in ["https://", "http://"] {
        if let Some(rest) = t.strip_prefix(scheme) {
            t = rest.to_string();
            break;
        }
    }
    if let Some(rest) = t.strip_prefix("www.") {
        t = rest.to_string();
    }
    t.trim_end_matches('/').to_string()
}
