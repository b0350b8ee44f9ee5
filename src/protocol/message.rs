//! Daemon message grammar.
//!
//! Every frame starts with a keyword followed by whitespace-separated
//! arguments. Attribute payloads are JSON and run to the end of the frame,
//! which for multi-line blocks means everything after the header line.
//!
//! | Frame                                   | Event                         |
//! |-----------------------------------------|-------------------------------|
//! | `PVD_LIST <name>*`                      | [`PvdEvent::PvdList`]         |
//! | `PVD_NEW_PVD <name>`                    | [`PvdEvent::NewPvd`]          |
//! | `PVD_DEL_PVD <name>`                    | [`PvdEvent::DelPvd`]          |
//! | `PVD_ATTRIBUTES <name> <json>`          | [`PvdEvent::PvdAttributes`]   |
//! | `PVD_ATTRIBUTE <name> <attr> <json>`    | [`PvdEvent::PvdAttribute`]    |
//!
//! Anything else is ignored, as is an attribute frame whose body is not
//! valid JSON.

use serde_json::Value;

use super::framing::Frame;
use crate::error::PvddError;

pub const PVD_LIST: &str = "PVD_LIST";
pub const PVD_NEW_PVD: &str = "PVD_NEW_PVD";
pub const PVD_DEL_PVD: &str = "PVD_DEL_PVD";
pub const PVD_ATTRIBUTES: &str = "PVD_ATTRIBUTES";
pub const PVD_ATTRIBUTE: &str = "PVD_ATTRIBUTE";

/// Everything a pvdd connection can report to its subscribers.
#[derive(Debug, Clone)]
pub enum PvdEvent {
    /// The socket is open (and promoted, for control connections).
    Connected,
    /// A transport or protocol fault. Transport faults close the socket.
    Error(PvddError),
    /// A raw, non-empty line as received, before any decoding.
    Data(String),
    /// Full list of PvD names.
    PvdList(Vec<String>),
    /// A PvD appeared.
    NewPvd(String),
    /// A PvD vanished.
    DelPvd(String),
    /// All attributes of one PvD.
    PvdAttributes { pvd: String, attributes: Value },
    /// One attribute of one PvD.
    PvdAttribute {
        pvd: String,
        name: String,
        value: Value,
    },
    /// Same payload as [`PvdEvent::PvdAttribute`], delivered on the
    /// per-attribute signal (`"on" + name`).
    NamedAttribute {
        name: String,
        pvd: String,
        value: Value,
    },
}

impl PartialEq for PvdEvent {
    fn eq(&self, other: &Self) -> bool {
        use PvdEvent::*;
        match (self, other) {
            (Connected, Connected) => true,
            (Error(a), Error(b)) => a.to_string() == b.to_string(),
            (Data(a), Data(b)) => a == b,
            (PvdList(a), PvdList(b)) => a == b,
            (NewPvd(a), NewPvd(b)) | (DelPvd(a), DelPvd(b)) => a == b,
            (
                PvdAttributes { pvd, attributes },
                PvdAttributes {
                    pvd: other_pvd,
                    attributes: other_attributes,
                },
            ) => pvd == other_pvd && attributes == other_attributes,
            (
                PvdAttribute { pvd, name, value },
                PvdAttribute {
                    pvd: p,
                    name: n,
                    value: v,
                },
            )
            | (
                NamedAttribute { pvd, name, value },
                NamedAttribute {
                    pvd: p,
                    name: n,
                    value: v,
                },
            ) => pvd == p && name == n && value == v,
            _ => false,
        }
    }
}

impl PvdEvent {
    /// The per-attribute companion of an attribute update.
    pub fn named_companion(&self) -> Option<PvdEvent> {
        match self {
            PvdEvent::PvdAttribute { pvd, name, value } => Some(PvdEvent::NamedAttribute {
                name: name.clone(),
                pvd: pvd.clone(),
                value: value.clone(),
            }),
            _ => None,
        }
    }
}

fn is_separator(c: char) -> bool {
    c == ' ' || c == '\n'
}

/// Split off the first token, returning it and the remainder with its
/// leading separators removed.
fn next_token(text: &str) -> (&str, &str) {
    let text = text.trim_start_matches(is_separator);
    match text.find(is_separator) {
        Some(end) => (&text[..end], text[end..].trim_start_matches(is_separator)),
        None => (text, ""),
    }
}

fn parse_json(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Dropping attribute payload that is not JSON: {}", e);
            None
        }
    }
}

/// Decode one frame into an event.
///
/// Returns `None` for unknown keywords, missing arguments and unparsable
/// JSON bodies. Never panics on malformed input.
pub fn interpret(frame: &Frame) -> Option<PvdEvent> {
    let (keyword, rest) = next_token(frame.as_str());

    match keyword {
        PVD_LIST => Some(PvdEvent::PvdList(
            rest.split_whitespace().map(str::to_string).collect(),
        )),
        PVD_NEW_PVD | PVD_DEL_PVD => {
            let (pvd, _) = next_token(rest);
            if pvd.is_empty() {
                return None;
            }
            let pvd = pvd.to_string();
            Some(if keyword == PVD_NEW_PVD {
                PvdEvent::NewPvd(pvd)
            } else {
                PvdEvent::DelPvd(pvd)
            })
        }
        PVD_ATTRIBUTES => {
            let (pvd, body) = next_token(rest);
            if pvd.is_empty() {
                return None;
            }
            let attributes = parse_json(body)?;
            Some(PvdEvent::PvdAttributes {
                pvd: pvd.to_string(),
                attributes,
            })
        }
        PVD_ATTRIBUTE => {
            let (pvd, rest) = next_token(rest);
            let (name, body) = next_token(rest);
            if pvd.is_empty() || name.is_empty() {
                return None;
            }
            let value = parse_json(body)?;
            Some(PvdEvent::PvdAttribute {
                pvd: pvd.to_string(),
                name: name.to_string(),
                value,
            })
        }
        _ => None,
    }
}
