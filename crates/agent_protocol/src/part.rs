//! Message-part vocabulary.
//!
//! Parts are pure data. Folding a stream of parts into a message is the
//! accumulator's job, not this module's.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::form::FormRender;
use crate::ids::TaskId;

/// One fragment of a message, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text(TextPart),
    File(FilePart),
    Data(DataPart),
    Source(SourcePart),
    Trajectory(TrajectoryPart),
    Form(FormRender),
    Auth(AuthPart),
    Transform(TransformPart),
    /// Any `kind` this client does not understand. Dropped by consumers.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    Text,
    File,
    Data,
    Source,
    Trajectory,
    Form,
    Auth,
    Transform,
    Unknown,
}

impl Part {
    #[must_use]
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Text(TextPart {
            id: id.into(),
            text: text.into(),
        })
    }

    #[must_use]
    pub fn transform(id: impl Into<String>, start_index: usize, transform: Transform) -> Self {
        Self::Transform(TransformPart {
            id: id.into(),
            start_index,
            transform,
        })
    }

    #[must_use]
    pub fn kind(&self) -> PartKind {
        match self {
            Self::Text(_) => PartKind::Text,
            Self::File(_) => PartKind::File,
            Self::Data(_) => PartKind::Data,
            Self::Source(_) => PartKind::Source,
            Self::Trajectory(_) => PartKind::Trajectory,
            Self::Form(_) => PartKind::Form,
            Self::Auth(_) => PartKind::Auth,
            Self::Transform(_) => PartKind::Transform,
            Self::Unknown => PartKind::Unknown,
        }
    }

    /// Returns the identifier used to detect re-statements of the same part.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Text(part) => Some(&part.id),
            Self::File(part) => Some(&part.id),
            Self::Data(part) => part.id.as_deref(),
            Self::Source(part) => Some(&part.id),
            Self::Trajectory(part) => Some(&part.id),
            Self::Form(form) => Some(&form.id),
            Self::Auth(part) => Some(&part.id),
            Self::Transform(part) => Some(&part.id),
            Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(part) => Some(&part.text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePart {
    pub id: String,
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: Map<String, Value>,
}

/// Citation pointing at an external document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePart {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_url: Option<String>,
}

/// Reasoning trace step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryPart {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Out-of-band authentication request. The user completes it at `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPart {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Deferred edit of already-delivered text, anchored at `start_index`
/// characters into the message's concatenated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformPart {
    pub id: String,
    pub start_index: usize,
    pub transform: Transform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Appends `text` to the end of the anchored text part.
    Append { text: String },
    /// Inserts `text` at the anchor.
    Insert { text: String },
    /// Inserts an inline markdown image at the anchor.
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alt: Option<String>,
    },
    /// Inserts citation markers for `sources` at the anchor.
    Source { sources: Vec<String> },
}

impl Transform {
    /// Applies this edit to `content` at character `offset`.
    ///
    /// Offsets past the end of `content` are clamped to its end.
    #[must_use]
    pub fn apply(&self, content: &str, offset: usize) -> String {
        match self {
            Self::Append { text } => {
                let mut out = String::with_capacity(content.len() + text.len());
                out.push_str(content);
                out.push_str(text);
                out
            }
            Self::Insert { text } => insert_at_char(content, offset, text),
            Self::Image { url, alt } => {
                let image = format!("![{}]({url})", alt.as_deref().unwrap_or(""));
                insert_at_char(content, offset, &image)
            }
            Self::Source { sources } => {
                let markers: String = sources.iter().map(|source| format!("[{source}]")).collect();
                insert_at_char(content, offset, &markers)
            }
        }
    }

    /// Returns the character position this edit writes at, for shifting later edits.
    ///
    /// Appends always land at the end and never shift anchored edits.
    #[must_use]
    pub fn anchor(&self, offset: usize) -> usize {
        match self {
            Self::Append { .. } => usize::MAX,
            Self::Insert { .. } | Self::Image { .. } | Self::Source { .. } => offset,
        }
    }
}

fn insert_at_char(content: &str, offset: usize, text: &str) -> String {
    let byte_index = content
        .char_indices()
        .nth(offset)
        .map_or(content.len(), |(index, _)| index);

    let mut out = String::with_capacity(content.len() + text.len());
    out.push_str(&content[..byte_index]);
    out.push_str(text);
    out.push_str(&content[byte_index..]);
    out
}
