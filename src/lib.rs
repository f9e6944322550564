//! Lanshare - LAN chat and file-sharing server
//!
//! Clients find the server with a UDP broadcast probe, log in over TCP and
//! then exchange chat messages and chunked file transfers. Every message on
//! the TCP stream is one JSON object terminated by `\n`.

use serde::{Deserialize, Serialize};

pub mod config;
pub mod discovery;
pub mod error;
pub mod external;
pub mod framing;
pub mod logging;
pub mod registry;
pub mod server;
pub mod session;
pub mod transfer;
pub mod users;

pub use error::{LanshareError, Result};
pub use transfer::FileKind;

/// Default TCP port for the chat and file service
pub const DEFAULT_TCP_PORT: u16 = 12345;

/// Default UDP port the discovery responder listens on
pub const DEFAULT_UDP_PORT: u16 = 37020;

/// Literal probe a client broadcasts to locate the server
pub const DISCOVERY_PROBE: &str = "DISCOVER_SERVER";

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Log in with an existing account
    Login { nickname: String, password: String },
    /// Create an account and log in with it
    Register { nickname: String, password: String },
    /// Chat message for everyone else
    Message { content: String },
    /// One chunk of a file upload
    File(FileUpload),
    /// Request the current file listing
    ListFiles {},
    /// Request a stored file
    DownloadFile { file_name: String },
}

/// Upload chunk as sent by the client.
///
/// `current_chunk` is 1-based. The payload is hex encoded. `sender` is
/// accepted for compatibility but the server always records the session's
/// nickname instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    pub file_name: String,
    #[serde(default = "default_declared_size")]
    pub file_size: String,
    #[serde(default = "one")]
    pub total_chunks: u64,
    #[serde(default = "one")]
    pub current_chunk: u64,
    pub file_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default = "default_date")]
    pub date: String,
}

fn default_declared_size() -> String {
    "0 B".to_string()
}

fn default_date() -> String {
    "Unknown".to_string()
}

fn one() -> u64 {
    1
}

/// Status carried by a `response` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of a request
    Response { status: Status, message: String },
    /// Chat message relayed from another user
    Message { sender: String, content: String },
    /// Current file listing
    FilesList { files: Vec<FileEntry> },
    /// A file upload finished
    NewFile(FileEntry),
    /// Header of a download
    FileInfo {
        file_name: String,
        file_size: String,
        file_type: FileKind,
        total_chunks: u64,
        sender: String,
        date: String,
    },
    /// One chunk of a download, hex encoded
    FileChunk {
        file_name: String,
        chunk_number: u64,
        total_chunks: u64,
        file_data: String,
    },
    /// Download finished
    FileComplete { file_name: String },
}

impl ServerMessage {
    pub fn success(message: impl Into<String>) -> Self {
        ServerMessage::Response {
            status: Status::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Response {
            status: Status::Error,
            message: message.into(),
        }
    }
}

/// Metadata of a stored file, as shown in listings and new-file notices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_name: String,
    pub file_size: String,
    pub file_type: FileKind,
    pub sender: String,
    pub date: String,
}

/// Result of decoding one inbound line.
///
/// A line whose `type` is not one of the known client message types is kept
/// apart from a malformed line: the former gets an error reply, the latter
/// ends the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Known(ClientMessage),
    Unknown(String),
}

const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "login",
    "register",
    "message",
    "file",
    "list_files",
    "download_file",
];

impl Inbound {
    /// Decode one line of the wire protocol
    pub fn decode(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| LanshareError::Protocol("message has no type field".to_string()))?;

        if !CLIENT_MESSAGE_TYPES.contains(&kind) {
            return Ok(Inbound::Unknown(kind.to_string()));
        }

        Ok(Inbound::Known(serde_json::from_value(value)?))
    }
}
