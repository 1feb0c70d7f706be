use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound for a single buffered, still incomplete control message.
pub const MAX_CONTROL_MESSAGE_BYTES: usize = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control stream closed")]
    Closed,
    #[error("control stream closed mid-message ({0} bytes pending)")]
    Truncated(usize),
    #[error("control message too large: {0} bytes")]
    TooLarge(usize),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// What the server asks the client to do.
///
/// Encoded as an integer tag. Tags this client does not know decode to `Unknown`
/// so newer servers can add actions without breaking older clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Action {
    RequestClientSession,
    Unknown(i64),
}

impl From<i64> for Action {
    fn from(v: i64) -> Self {
        match v {
            0 => Action::RequestClientSession,
            other => Action::Unknown(other),
        }
    }
}

impl From<Action> for i64 {
    fn from(a: Action) -> Self {
        match a {
            Action::RequestClientSession => 0,
            Action::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "action", alias = "Action")]
    pub action: Action,
    #[serde(rename = "localPort", alias = "LocalPort", default)]
    pub local_port: String,
}

#[cfg(test)]
impl ControlMessage {
    pub fn request_client_session(local_port: impl Into<String>) -> Self {
        Self {
            action: Action::RequestClientSession,
            local_port: local_port.into(),
        }
    }
}

/// Decodes a stream of concatenated JSON control messages, one at a time.
pub struct ControlDecoder<R> {
    r: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> ControlDecoder<R> {
    pub fn new(r: R) -> Self {
        Self {
            r,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn next_message(&mut self) -> Result<ControlMessage, ControlError> {
        loop {
            if let Some(msg) = self.try_decode()? {
                return Ok(msg);
            }
            if self.buf.len() > MAX_CONTROL_MESSAGE_BYTES {
                return Err(ControlError::TooLarge(self.buf.len()));
            }

            self.buf.reserve(4096);
            let n = self.r.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(ControlError::Closed);
                }
                return Err(ControlError::Truncated(self.buf.len()));
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<ControlMessage>, ControlError> {
        let mut it = serde_json::Deserializer::from_slice(&self.buf).into_iter::<ControlMessage>();
        match it.next() {
            // Nothing but whitespace buffered.
            None => {
                self.buf.clear();
                Ok(None)
            }
            Some(Ok(msg)) => {
                let used = it.byte_offset();
                self.buf.advance(used);
                Ok(Some(msg))
            }
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => Err(err.into()),
        }
    }
}
