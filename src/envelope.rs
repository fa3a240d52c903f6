//! Delivery modes negotiated at hello time, and the plaintext shapes carried
//! by the json envelope.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// How application bytes travel once a session exists. Fixed for the
/// lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    /// One long-lived encrypted byte stream per connection.
    Tcp,
    /// One sealed request and one sealed response per call.
    Json,
}

impl Envelope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Envelope {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "json" => Ok(Self::Json),
            other => Err(SessionError::BadRequest(format!(
                "envelope must be tcp or json, got {other:?}"
            ))),
        }
    }
}

/// A header value as carried in the json envelope: one string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
}

impl HeaderField {
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(vs) => vs,
        };
        slice.iter().map(String::as_str)
    }

    /// Append a repeated header value.
    pub fn push(&mut self, value: String) {
        match self {
            Self::One(first) => {
                let first = std::mem::take(first);
                *self = Self::Many(vec![first, value]);
            }
            Self::Many(values) => values.push(value),
        }
    }
}

pub type Headers = BTreeMap<String, HeaderField>;

fn decode_body(body: &Option<String>) -> Result<Option<Vec<u8>>, SessionError> {
    body.as_deref()
        .map(|b| {
            BASE64_STANDARD
                .decode(b)
                .map_err(|e| SessionError::ProtocolViolation(format!("body is not base64: {e}")))
        })
        .transpose()
}

/// The plaintext of a json-envelope call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerRequest {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl InnerRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into(), HeaderField::One(value.into()));
        self
    }

    pub fn body(mut self, body: impl AsRef<[u8]>) -> Self {
        self.body = Some(BASE64_STANDARD.encode(body));
        self
    }

    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, SessionError> {
        decode_body(&self.body)
    }
}

/// The plaintext answer to an [`InnerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl InnerResponse {
    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, SessionError> {
        decode_body(&self.body)
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.values().next())
    }
}
