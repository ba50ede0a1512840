//! Transfer wire format.
//!
//! Both negotiation messages are length-prefixed JSON frames: a 4-byte
//! big-endian length, then the document. After an `accepted` response the
//! stream carries exactly `size_bytes` raw bytes with no further framing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;

/// Largest negotiation frame either side accepts.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Sent by the fetching peer right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub file_name: String,
    /// Username of the fetching peer, for the server's logs.
    #[serde(default)]
    pub requester: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Accepted,
    NotFound,
}

/// The serving peer's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResponse {
    pub status: TransferStatus,
    #[serde(default)]
    pub size_bytes: u64,
}

impl TransferResponse {
    pub fn accepted(size_bytes: u64) -> Self {
        Self {
            status: TransferStatus::Accepted,
            size_bytes,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: TransferStatus::NotFound,
            size_bytes: 0,
        }
    }
}

/// Write one frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(NetworkError::Protocol(format!(
            "frame of {} bytes exceeds {MAX_FRAME_BYTES}",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A length above [`MAX_FRAME_BYTES`] is refused before
/// anything is allocated.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, NetworkError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(NetworkError::Protocol(format!(
            "announced frame of {len} bytes exceeds {MAX_FRAME_BYTES}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_layout() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &TransferResponse::accepted(1000))
            .await
            .unwrap();
        drop(a);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        let body = br#"{"status":"accepted","size_bytes":1000}"#;
        assert_eq!(&raw[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&raw[4..], body);
    }

    #[tokio::test]
    async fn test_request_frame_exchange() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = TransferRequest {
            file_name: "my book.pdf".into(),
            requester: "bob".into(),
        };
        write_frame(&mut a, &req).await.unwrap();
        let got: TransferRequest = read_frame(&mut b).await.unwrap();
        assert_eq!(got, req);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_BYTES + 1) as u32).await.unwrap();
        let result: Result<TransferRequest, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(NetworkError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(100).await.unwrap();
        a.write_all(b"{\"status\"").await.unwrap();
        drop(a);
        let result: Result<TransferResponse, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(NetworkError::Io(_))));
    }

    #[test]
    fn test_not_found_json() {
        let json = serde_json::to_string(&TransferResponse::not_found()).unwrap();
        assert_eq!(json, r#"{"status":"not_found","size_bytes":0}"#);
    }
}
