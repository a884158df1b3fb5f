//! On-wire framing for the transfer protocol.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use dsc_common::ContentFingerprint;

/// Bytes in a full-content request frame: 64 hex chars + newline.
pub const FULL_REQUEST_LEN: usize = 65;
/// Bytes in a range request frame: 64 hex chars + two 8-byte words + newline.
pub const RANGE_REQUEST_LEN: usize = 81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRequest {
    Full {
        hash: ContentFingerprint,
    },
    /// Inclusive byte range `[start, end]`.
    Range {
        hash: ContentFingerprint,
        start: u64,
        end: u64,
    },
}

impl TransferRequest {
    pub fn hash(&self) -> &ContentFingerprint {
        match self {
            TransferRequest::Full { hash } => hash,
            TransferRequest::Range { hash, .. } => hash,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            TransferRequest::Full { hash } => {
                let mut frame = Vec::with_capacity(FULL_REQUEST_LEN);
                frame.extend_from_slice(hash.to_hex().as_bytes());
                frame.push(b'\n');
                frame
            }
            TransferRequest::Range { hash, start, end } => {
                let mut frame = Vec::with_capacity(RANGE_REQUEST_LEN);
                frame.extend_from_slice(hash.to_hex().as_bytes());
                frame.extend_from_slice(&start.to_be_bytes());
                frame.extend_from_slice(&end.to_be_bytes());
                frame.push(b'\n');
                frame
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Structurally invalid frame. The server answers these with a zero
    /// size word rather than closing abruptly.
    #[error("malformed request frame: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one request frame.
///
/// Both frame forms share a 64-hex-char prefix; the 65th byte
/// disambiguates: a newline ends a full request, anything else is the
/// first byte of a range request's start word.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<TransferRequest, WireError> {
    let mut head = [0u8; FULL_REQUEST_LEN];
    reader.read_exact(&mut head).await?;

    let hex = std::str::from_utf8(&head[..64]).map_err(|_| WireError::Malformed("non-utf8 hash"))?;
    let hash: ContentFingerprint = hex
        .parse()
        .map_err(|_| WireError::Malformed("invalid hash hex"))?;

    if head[64] == b'\n' {
        return Ok(TransferRequest::Full { hash });
    }

    let mut tail = [0u8; RANGE_REQUEST_LEN - FULL_REQUEST_LEN];
    reader.read_exact(&mut tail).await?;
    if tail[15] != b'\n' {
        return Err(WireError::Malformed("missing frame terminator"));
    }

    let mut word = [0u8; 8];
    word[0] = head[64];
    word[1..].copy_from_slice(&tail[..7]);
    let start = u64::from_be_bytes(word);
    word.copy_from_slice(&tail[7..15]);
    let end = u64::from_be_bytes(word);

    Ok(TransferRequest::Range { hash, start, end })
}

/// Write the 8-byte big-endian size word.
pub async fn write_size<W: AsyncWrite + Unpin>(writer: &mut W, size: u64) -> std::io::Result<()> {
    writer.write_all(&size.to_be_bytes()).await?;
    writer.flush().await
}

/// Read the 8-byte big-endian size word.
pub async fn read_size<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<u64> {
    let mut word = [0u8; 8];
    reader.read_exact(&mut word).await?;
    Ok(u64::from_be_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hash_of(content: &[u8]) -> ContentFingerprint {
        ContentFingerprint::digest(content)
    }

    #[tokio::test]
    async fn full_request_frame_is_65_bytes_and_round_trips() {
        let hash = hash_of(b"test content for download");
        let frame = TransferRequest::Full { hash }.encode();
        assert_eq!(frame.len(), FULL_REQUEST_LEN);
        assert_eq!(frame[..64], *hash.to_hex().as_bytes());
        assert_eq!(frame[64], b'\n');

        let parsed = read_request(&mut Cursor::new(frame)).await.unwrap();
        assert_eq!(parsed, TransferRequest::Full { hash });
    }

    #[tokio::test]
    async fn range_request_frame_is_81_bytes_and_round_trips() {
        let hash = hash_of(b"0123456789ABCDEF");
        let frame = TransferRequest::Range {
            hash,
            start: 5,
            end: 11,
        }
        .encode();
        assert_eq!(frame.len(), RANGE_REQUEST_LEN);
        assert_eq!(frame[80], b'\n');

        let parsed = read_request(&mut Cursor::new(frame)).await.unwrap();
        assert_eq!(
            parsed,
            TransferRequest::Range {
                hash,
                start: 5,
                end: 11
            }
        );
    }

    #[tokio::test]
    async fn invalid_hex_is_malformed() {
        let mut frame = vec![b'z'; 64];
        frame.push(b'\n');
        let err = read_request(&mut Cursor::new(frame)).await.unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let frame = vec![b'a'; 10];
        let err = read_request(&mut Cursor::new(frame)).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[tokio::test]
    async fn size_word_round_trips_big_endian() {
        let mut buf = Vec::new();
        write_size(&mut buf, 25).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 0x19]);
        assert_eq!(read_size(&mut Cursor::new(buf)).await.unwrap(), 25);
    }
}
