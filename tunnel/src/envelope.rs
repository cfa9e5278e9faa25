//! Envelope wire format.
//!
//! An envelope is a single JSON header line followed by an opaque body:
//!
//! ```text
//! {"dsn":"https://key@sentry.example.com/42","sent_at":"2024-01-01T00:00:00Z"}
//! {"type":"event","length":41}
//! {"message":"hello","level":"error"}
//! ```
//!
//! Only the header is decoded. Everything after the first `\n` belongs to the
//! body and is passed through untouched, including further line breaks.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed envelope")]
    MalformedEnvelope,
    #[error("malformed header")]
    MalformedHeader,
}

/// SDK information as sent by the client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SdkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// The envelope header.
///
/// Only `dsn` is interpreted, so it is the only field whose type can make a
/// header invalid. Every other field is carried in `other` as received; the
/// accessors below read the well-known ones and return `None` when a client
/// sent them with an unexpected type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl EnvelopeHeader {
    pub fn sdk(&self) -> Option<SdkInfo> {
        self.other
            .get("sdk")
            .and_then(|sdk| SdkInfo::deserialize(sdk).ok())
    }

    pub fn sent_at(&self) -> Option<&str> {
        self.other.get("sent_at").and_then(Value::as_str)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.other.get("event_id").and_then(Value::as_str)
    }
}

#[derive(Clone, Debug)]
pub struct Envelope {
    header: EnvelopeHeader,
    /// The header line exactly as received. Cleared once the header is
    /// mutated, at which point serialization re-encodes `header`.
    raw_header: Option<Bytes>,
    body: Bytes,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.body == other.body
    }
}

impl Envelope {
    pub fn new(header: EnvelopeHeader, body: Bytes) -> Self {
        Self {
            header,
            raw_header: None,
            body,
        }
    }

    pub fn parse(raw: Bytes) -> Result<Self, ParseError> {
        let newline = raw
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(ParseError::MalformedEnvelope)?;

        let raw_header = raw.slice(..newline);
        let body = raw.slice(newline + 1..);

        // Decoding into a map first guarantees the header is a JSON object.
        let fields: Map<String, Value> =
            serde_json::from_slice(&raw_header).map_err(|_| ParseError::MalformedHeader)?;
        let header = EnvelopeHeader::deserialize(Value::Object(fields))
            .map_err(|_| ParseError::MalformedHeader)?;

        Ok(Self {
            header,
            raw_header: Some(raw_header),
            body,
        })
    }

    /// Encodes the envelope back into its wire format.
    ///
    /// A freshly parsed envelope serializes to exactly the bytes it was parsed
    /// from. After [`Envelope::header_mut`] the header is re-encoded with `dsn`
    /// first, followed by the carried fields in key order.
    pub fn serialize(&self) -> Result<Bytes, serde_json::Error> {
        let mut out = BytesMut::with_capacity(self.body.len() + 256);

        match &self.raw_header {
            Some(raw) => out.put_slice(raw),
            None => serde_json::to_writer((&mut out).writer(), &self.header)?,
        }
        out.put_u8(b'\n');
        out.put_slice(&self.body);

        Ok(out.freeze())
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut EnvelopeHeader {
        self.raw_header = None;
        &mut self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
