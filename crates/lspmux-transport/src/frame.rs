//! Content-Length framed JSON messages.
//!
//! Each message is `Content-Length: <n>\r\n\r\n<n bytes of JSON>`. Unknown
//! headers are skipped.

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use crate::error::FrameError;

/// Encode one JSON message with Content-Length framing.
pub fn encode_frame(msg: &Value) -> Result<Bytes, serde_json::Error> {
    let body = serde_json::to_string(msg)?;
    let mut framed = Vec::with_capacity(body.len() + 32);
    framed.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    framed.extend_from_slice(body.as_bytes());
    Ok(Bytes::from(framed))
}

/// Read one framed JSON message. Returns `Ok(None)` on clean EOF at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Value>, FrameError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut content_length: Option<usize> = None;

    // Headers until empty line
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if content_length.is_some() || !line.is_empty() {
                return Err(FrameError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended mid-frame",
                )));
            }
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some(len_str) = trimmed.strip_prefix("Content-Length:") {
            content_length = Some(
                len_str
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidHeader(trimmed.to_string()))?,
            );
        }
    }

    let len = content_length.ok_or_else(|| FrameError::InvalidHeader("missing Content-Length".into()))?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
