//! JSON messages exchanged with clients over the WebSocket.
//!
//! Client frames carry an optional correlation `id` and an `op`. Server frames
//! are tagged by `type`: `reply` and `error` answer a request, the others are
//! pushed as streams produce events.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::ids::StreamId;
use crate::jail::FileEntry;
use crate::mux::StreamEvent;
use crate::runner::ProcessStatus;

/// How the bytes of a [`Payload`] are carried in JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

/// Arbitrary bytes in a JSON-safe form. Clients may also send a bare string,
/// which is taken as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PayloadRepr")]
pub struct Payload {
    pub data: String,
    pub encoding: Encoding,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PayloadRepr {
    Text(String),
    Object {
        data: String,
        #[serde(default)]
        encoding: Encoding,
    },
}

impl From<PayloadRepr> for Payload {
    fn from(repr: PayloadRepr) -> Self {
        match repr {
            PayloadRepr::Text(data) => Payload {
                data,
                encoding: Encoding::Utf8,
            },
            PayloadRepr::Object { data, encoding } => Payload { data, encoding },
        }
    }
}

impl Payload {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            encoding: Encoding::Utf8,
        }
    }

    /// UTF-8 when the bytes allow it, base64 otherwise.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::text(text),
            Err(_) => Self {
                data: BASE64.encode(bytes),
                encoding: Encoding::Base64,
            },
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.encoding {
            Encoding::Utf8 => Ok(self.data.into_bytes()),
            Encoding::Base64 => BASE64
                .decode(self.data.as_bytes())
                .map_err(|e| GatewayError::InvalidRequest(format!("bad base64 payload: {e}"))),
        }
    }
}

/// One client request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Command {
    ListFiles {
        #[serde(default)]
        path: String,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: Payload,
    },
    DeleteFile {
        path: String,
    },
    CreateDirectory {
        path: String,
    },
    RenamePath {
        from: String,
        to: String,
    },
    InstallPackage {
        name: String,
    },
    InstallRequirements,
    RunSnippet {
        code: String,
        language: String,
        #[serde(default, rename = "timeoutSecs")]
        timeout_secs: Option<u64>,
    },
    OpenShell {
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        cols: Option<u16>,
    },
    SendInput {
        stream: StreamId,
        data: Payload,
    },
    ResizeTerminal {
        stream: StreamId,
        rows: u16,
        cols: u16,
    },
    CloseStream {
        stream: StreamId,
    },
}

impl Command {
    /// Stream control that must be applied in arrival order.
    pub fn is_stream_control(&self) -> bool {
        matches!(
            self,
            Command::SendInput { .. } | Command::ResizeTerminal { .. } | Command::CloseStream { .. }
        )
    }
}

/// A request frame: correlation id plus command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub command: Command,
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Listing { entries: Vec<FileEntry> },
    File { content: Payload },
    Stream { stream: StreamId },
    Done {},
}

/// Everything the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Reply {
        id: Option<u64>,
        result: Reply,
    },
    Error {
        id: Option<u64>,
        kind: &'static str,
        message: String,
    },
    StreamOutput {
        stream: StreamId,
        #[serde(flatten)]
        payload: Payload,
    },
    StreamEnded {
        stream: StreamId,
        status: ProcessStatus,
    },
    StreamPreview {
        stream: StreamId,
        url: String,
    },
    FileChanged {
        path: String,
    },
}

impl ServerMessage {
    pub fn error(id: Option<u64>, err: &GatewayError) -> Self {
        ServerMessage::Error {
            id,
            kind: err.code(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of these types cannot fail: no maps with non-string
        // keys and no custom serializers.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<StreamEvent> for ServerMessage {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Output { stream, data } => ServerMessage::StreamOutput {
                stream,
                payload: Payload::from_bytes(&data),
            },
            StreamEvent::Ended { stream, status } => ServerMessage::StreamEnded { stream, status },
            StreamEvent::Preview { stream, url } => ServerMessage::StreamPreview { stream, url },
            StreamEvent::FileChanged { path } => ServerMessage::FileChanged { path },
        }
    }
}
