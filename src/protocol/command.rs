//! Client-to-daemon commands.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::framing::{BEGIN_MULTILINE, END_MULTILINE};

/// Indentation used for attribute values in `PVD_SET_ATTRIBUTE` blocks.
const SET_ATTRIBUTE_INDENT: &[u8] = b"            ";

/// A command understood by pvdd.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `PVD_CREATE_PVD 0 <name>`
    CreatePvd { pvd: String },
    /// `PVD_REMOVE_PVD <name>` (control connections only)
    RemovePvd { pvd: String },
    /// Transaction-wrapped multi-line `PVD_SET_ATTRIBUTE`.
    SetAttribute {
        pvd: String,
        name: String,
        value: Value,
    },
    /// `PVD_UNSET_ATTRIBUTE <name> <attr>`
    UnsetAttribute { pvd: String, name: String },
    /// `PVD_GET_LIST`
    GetList,
    /// `PVD_GET_ATTRIBUTES <name>`
    GetAttributes { pvd: String },
    /// `PVD_GET_ATTRIBUTE <name> <attr>`
    GetAttribute { pvd: String, name: String },
    /// `PVD_SUBSCRIBE <attr|*>`
    Subscribe { name: String },
    /// `PVD_UNSUBSCRIBE <attr|*>`
    Unsubscribe { name: String },
    /// `PVD_SUBSCRIBE_NOTIFICATIONS`
    SubscribeNotifications,
    /// `PVD_UNSUBSCRIBE_NOTIFICATIONS`
    UnsubscribeNotifications,
    /// `PVD_CONNECTION_PROMOTE_CONTROL`
    PromoteControl,
}

/// Serialize a value the way pvdd clients traditionally do (pretty-printed,
/// 12-space indentation).
fn pretty_value(value: &Value) -> String {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(SET_ATTRIBUTE_INDENT);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    match value.serialize(&mut serializer) {
        // serde_json only ever emits valid UTF-8
        Ok(()) => String::from_utf8_lossy(&out).into_owned(),
        Err(_) => value.to_string(),
    }
}

impl Command {
    /// Render the command as it goes on the wire, newline-terminated.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::CreatePvd { pvd } => writeln!(f, "PVD_CREATE_PVD 0 {}", pvd),
            Command::RemovePvd { pvd } => writeln!(f, "PVD_REMOVE_PVD {}", pvd),
            Command::SetAttribute { pvd, name, value } => {
                writeln!(f, "PVD_BEGIN_TRANSACTION {}", pvd)?;
                writeln!(f, "{}", BEGIN_MULTILINE)?;
                writeln!(f, "PVD_SET_ATTRIBUTE {} {}", pvd, name)?;
                writeln!(f, "{}", pretty_value(value))?;
                writeln!(f, "{}", END_MULTILINE)?;
                writeln!(f, "PVD_END_TRANSACTION {}", pvd)
            }
            Command::UnsetAttribute { pvd, name } => {
                writeln!(f, "PVD_UNSET_ATTRIBUTE {} {}", pvd, name)
            }
            Command::GetList => writeln!(f, "PVD_GET_LIST"),
            Command::GetAttributes { pvd } => writeln!(f, "PVD_GET_ATTRIBUTES {}", pvd),
            Command::GetAttribute { pvd, name } => {
                writeln!(f, "PVD_GET_ATTRIBUTE {} {}", pvd, name)
            }
            Command::Subscribe { name } => writeln!(f, "PVD_SUBSCRIBE {}", name),
            Command::Unsubscribe { name } => writeln!(f, "PVD_UNSUBSCRIBE {}", name),
            Command::SubscribeNotifications => writeln!(f, "PVD_SUBSCRIBE_NOTIFICATIONS"),
            Command::UnsubscribeNotifications => writeln!(f, "PVD_UNSUBSCRIBE_NOTIFICATIONS"),
            Command::PromoteControl => writeln!(f, "PVD_CONNECTION_PROMOTE_CONTROL"),
        }
    }
}
