//! promptd wire protocol
//!
//! Client ↔ daemon messages travel over the Unix socket as length-prefixed
//! bincode frames:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Message ID  │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! A connection carries exactly one request. A render request is answered by
//! one or more [`PromptResponse`] frames, the last of which is always of type
//! [`ResponseType::Complete`]. Administrative requests are answered by a single
//! [`AdminResponse`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Current protocol version. Bump on any breaking change to these types.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum message size (4MB to prevent memory exhaustion)
const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Message ID counter type (unique per message for request/response correlation)
pub type MessageId = u32;

/// Message envelope containing all possible message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client asks for a prompt render (streamed answer)
    Render(PromptRequest),
    /// Daemon streams a render result
    Response(PromptResponse),
    /// Client toggles segment visibility for a session
    ToggleSegment(ToggleSegmentRequest),
    /// Client clears the whole value cache
    CacheClear,
    /// Client sets the default cache TTL, in days
    CacheSetTtl { days: i32 },
    /// Client asks for the default cache TTL
    CacheGetTtl,
    /// Client enables file logging at `path`, or disables it when empty
    SetLogging { path: String },
    /// Daemon answers an administrative request
    Ack(AdminResponse),
}

/// Everything the daemon needs to know about the shell line being drawn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderFlags {
    /// Which prompt is wanted ("primary", "right", ...)
    pub prompt_type: String,
    /// Prompt configuration path; empty uses the daemon's default
    pub config_path: String,
    /// Working directory of the shell
    pub pwd: String,
    pub shell: String,
    pub shell_version: String,
    /// Exit status of the last command
    pub error_code: i32,
    pub pipe_status: String,
    /// Duration of the last command in milliseconds
    pub execution_time: f64,
    pub terminal_width: i32,
    pub prompt_count: i32,
    pub job_count: i32,
    /// Render without ANSI escapes
    pub plain: bool,
    pub cleared: bool,
}

/// Render request (Client → Daemon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Must equal [`PROTOCOL_VERSION`]
    pub version: u32,
    pub session_id: String,
    /// Unique per call, echoed in every response
    pub request_id: String,
    /// Shell process id, 0 when unknown
    pub pid: i32,
    /// Shell environment variables
    pub env: HashMap<String, String>,
    pub flags: RenderFlags,
}

/// Kind of streamed render response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    /// Partial prompt, more responses follow
    Update,
    /// Final prompt for the request
    Complete,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Update => "update",
            ResponseType::Complete => "complete",
        }
    }
}

/// Render response (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResponse {
    pub kind: ResponseType,
    pub request_id: String,
    /// Prompt kind ("primary", "right", "secondary", "transient") to text
    pub prompts: HashMap<String, String>,
    /// Non-empty when the request failed
    pub error: String,
}

impl PromptResponse {
    pub fn new(kind: ResponseType, request_id: &str, prompts: HashMap<String, String>) -> Self {
        Self {
            kind,
            request_id: request_id.to_string(),
            prompts,
            error: String::new(),
        }
    }

    /// Terminal response carrying an error
    pub fn failure(request_id: &str, error: impl Into<String>) -> Self {
        Self {
            kind: ResponseType::Complete,
            request_id: request_id.to_string(),
            prompts: HashMap::new(),
            error: error.into(),
        }
    }

    pub fn prompt(&self, name: &str) -> &str {
        self.prompts.get(name).map(String::as_str).unwrap_or("")
    }
}

/// Toggle request (Client → Daemon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleSegmentRequest {
    pub session_id: String,
    /// Segment names to flip between shown and hidden
    pub segments: Vec<String>,
}

/// Answer to any administrative request (Daemon → Client)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub success: bool,
    pub error: String,
    /// Only meaningful for `CacheGetTtl`
    pub days: i32,
}

impl AdminResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            days: 0,
        }
    }
}

/// Encode a message into the wire format
///
/// Format: [4-byte length][4-byte message ID][bincode payload]
pub fn encode_message(message: &Message, message_id: MessageId) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let payload_len = payload.len() as u32;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", payload_len),
        ));
    }

    let mut buffer = Vec::with_capacity(8 + payload.len());

    // Length prefix covers message_id + payload
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&message_id.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Decode a message from the wire format
///
/// Returns (message, message_id)
pub fn decode_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let frame_len = u32::from_le_bytes(len_bytes);

    if frame_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Message length too small",
        ));
    }
    if frame_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", frame_len),
        ));
    }

    let mut id_bytes = [0u8; 4];
    reader.read_exact(&mut id_bytes)?;
    let message_id = u32::from_le_bytes(id_bytes);

    let mut payload = vec![0u8; (frame_len - 4) as usize];
    reader.read_exact(&mut payload)?;

    let message: Message = bincode::deserialize(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok((message, message_id))
}

/// Write a message to a stream
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &Message,
    message_id: MessageId,
) -> io::Result<()> {
    let bytes = encode_message(message, message_id)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a message from a stream
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    decode_message(reader)
}
