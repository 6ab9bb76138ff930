use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Online => "Online",
            Self::Offline => "Offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingReport {
    pub device_id: String,
    pub final_value: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    /// 2xx with a non-blank body. Anything else counts as offline.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && !self.body.trim_ascii().is_empty()
    }
}

/// Largest reply body kept from the collector.
pub const MAX_REPLY_BODY: usize = 2048;

/// Appends `chunk` while the body stays within `MAX_REPLY_BODY`. Returns
/// false, leaving `body` untouched, once the chunk would overflow it.
pub fn append_reply_chunk(body: &mut Vec<u8>, chunk: &[u8]) -> bool {
    if body.len() + chunk.len() > MAX_REPLY_BODY {
        return false;
    }
    body.extend_from_slice(chunk);
    true
}
