//! Text protocol for project content synchronization.
//!
//! Wire format, one frame per logical event:
//! ```text
//! ┌───────────────┬───────┬──────────────────────────────┐
//! │ command token │ space │ JSON body (command excluded) │
//! └───────────────┴───────┴──────────────────────────────┘
//! ```
//!
//! - `create {"id": ..., "type": "block", "name": ...}`
//! - `update {"id": ..., <changed attributes>...}`
//! - `delete {"id": ...}`
//! - `put    {"id": ..., "after": ...?}`
//!
//! A full snapshot is the exception: a bare JSON array of complete element
//! objects, recognized by the body starting with `[`. The server sends one
//! on every fresh connection open and it replaces the entire local tree.
//!
//! Decoding splits token from body at the first `{`. A frame that fails to
//! parse, or an update lacking an identifier, yields a typed error; the
//! connection layer drops such frames without disrupting the socket.

use std::str::FromStr;

use serde_json::{Map, Value};

use kanva_core::{Element, ElementId, ElementKind, Patch};

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// A new element. Carries identity only; attributes start at defaults.
    Create {
        id: ElementId,
        kind: ElementKind,
        name: String,
    },
    /// Attribute changes for one element. Null values clear attributes.
    Update { id: ElementId, patch: Patch },
    /// Deletion of one element. The authoritative side cascades and echoes
    /// per-descendant deletes.
    Delete { id: ElementId },
    /// Reorder: place `id` immediately after `after` in the global order,
    /// or at the front when `after` is absent.
    Put {
        id: ElementId,
        after: Option<ElementId>,
    },
    /// Full replacement of the element collection.
    Snapshot(Vec<Element>),
}

impl Command {
    /// Serialize to the textual wire form.
    pub fn encode(&self) -> String {
        match self {
            Command::Create { id, kind, name } => {
                let mut body = Map::new();
                body.insert("id".into(), Value::from(id.clone()));
                body.insert(
                    "type".into(),
                    Value::from(match kind {
                        ElementKind::Block => "block",
                        ElementKind::Text => "text",
                    }),
                );
                body.insert("name".into(), Value::from(name.clone()));
                format!("create {}", Value::Object(body))
            }
            Command::Update { id, patch } => {
                let mut body = Map::new();
                body.insert("id".into(), Value::from(id.clone()));
                for (key, value) in patch {
                    body.insert(key.clone(), value.clone());
                }
                format!("update {}", Value::Object(body))
            }
            Command::Delete { id } => {
                let mut body = Map::new();
                body.insert("id".into(), Value::from(id.clone()));
                format!("delete {}", Value::Object(body))
            }
            Command::Put { id, after } => {
                let mut body = Map::new();
                body.insert("id".into(), Value::from(id.clone()));
                if let Some(after) = after {
                    body.insert("after".into(), Value::from(after.clone()));
                }
                format!("put {}", Value::Object(body))
            }
            Command::Snapshot(elements) => {
                serde_json::to_string(elements).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }

    /// Parse a textual frame.
    pub fn decode(frame: &str) -> Result<Command, ProtocolError> {
        let trimmed = frame.trim_start();
        if trimmed.starts_with('[') {
            let elements: Vec<Element> = serde_json::from_str(trimmed)
                .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
            return Ok(Command::Snapshot(elements));
        }

        let brace = frame
            .find('{')
            .ok_or_else(|| ProtocolError::MalformedFrame("no JSON body".into()))?;
        let token = frame[..brace].trim();
        let body: Value = serde_json::from_str(&frame[brace..])
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        let body = match body {
            Value::Object(map) => map,
            _ => return Err(ProtocolError::MalformedFrame("body is not an object".into())),
        };

        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingId)?
            .to_string();

        match token {
            "create" => {
                let kind = body
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(|s| ElementKind::from_str(s).ok())
                    .ok_or_else(|| {
                        ProtocolError::MalformedFrame("create without a valid type".into())
                    })?;
                let name = body
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Command::Create { id, kind, name })
            }
            "update" => {
                let mut patch = Patch::new();
                for (key, value) in body {
                    if key != "id" {
                        patch.insert(key, value);
                    }
                }
                Ok(Command::Update { id, patch })
            }
            "delete" => Ok(Command::Delete { id }),
            "put" => {
                let after = body
                    .get("after")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Command::Put { id, after })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Protocol and transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame or body could not be parsed.
    MalformedFrame(String),
    /// A command frame without a string `id`.
    MissingId,
    /// Unrecognized command token.
    UnknownCommand(String),
    /// The connection (or the session owning it) is gone.
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedFrame(e) => write!(f, "malformed frame: {e}"),
            Self::MissingId => write!(f, "frame is missing an element id"),
            Self::UnknownCommand(token) => write!(f, "unknown command token: {token}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
