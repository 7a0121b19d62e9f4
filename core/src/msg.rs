/// Message body parsing and wire serialization.
///
/// A body is plain text unless it starts with the `@` marker: `@@` escapes
/// a literal leading `@` in plain text, anything else after `@` is a JSON
/// array of tagged parts. Parsing is pure and total; malformed structured
/// bodies decay to a single Unknown part.
use crate::remote::schema::MessageRow;
use crate::stamp::Stamp;
use serde::{Deserialize, Serialize};

/// Marker introducing a structured (or escaped) body on the wire
const STRUCTURED_MARKER: char = '@';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MsgPart {
    #[serde(rename = "TXT")]
    Text { body: String },
    #[serde(rename = "IMG")]
    Image { body: String },
    #[serde(rename = "IMGURL")]
    ImageUrl { body: String },
    #[serde(rename = "URL")]
    Url { body: String },
    #[serde(rename = "LATLNG")]
    LatLng { body: String },
    #[serde(rename = "USER")]
    UserRef { body: String },
    #[serde(rename = "?")]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MsgBody {
    Text(String),
    Parts(Vec<MsgPart>),
}

impl MsgBody {
    /// Serializes for upload. Plain text starting with the marker is
    /// escaped by doubling it; parts go out as marker + JSON array.
    pub fn to_wire(&self) -> String {
        match self {
            MsgBody::Text(text) => {
                if text.starts_with(STRUCTURED_MARKER) {
                    format!("{}{}", STRUCTURED_MARKER, text)
                } else {
                    text.clone()
                }
            }
            MsgBody::Parts(parts) => {
                let json = serde_json::to_string(parts).unwrap_or_else(|_| "[]".to_string());
                format!("{}{}", STRUCTURED_MARKER, json)
            }
        }
    }
}

/// Read-only derived view of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgData {
    pub id: i64,
    pub outgoing: bool,
    pub body: MsgBody,
    pub stamp: Stamp,
}

/// Derives the local view of a wire row for the given local user
pub fn parse_msg(self_id: &str, row: &MessageRow) -> MsgData {
    MsgData {
        id: row.id,
        outgoing: row.sender == self_id,
        body: parse_body(&row.body),
        stamp: Stamp::from_iso(&row.timestamp),
    }
}

fn parse_body(raw: &str) -> MsgBody {
    let Some(rest) = raw.strip_prefix(STRUCTURED_MARKER) else {
        return MsgBody::Text(raw.to_string());
    };
    // "@@..." is an escaped plain-text body
    if rest.starts_with(STRUCTURED_MARKER) {
        return MsgBody::Text(rest.to_string());
    }
    match serde_json::from_str::<Vec<MsgPart>>(rest) {
        Ok(parts) if !parts.is_empty() => MsgBody::Parts(parts),
        _ => MsgBody::Parts(vec![MsgPart::Unknown]),
    }
}
