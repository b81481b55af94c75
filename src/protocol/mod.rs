//! Protocol definitions and the identity handshake
//!
//! Before any frame is exchanged, both ends of a new link announce who they
//! are:
//! ```text
//! +--------+--------+--------+--------+
//! |          Magic "BFRT" (4B)        |
//! +--------+--------+--------+--------+
//! | Version|  Identity length (2B)    |
//! +--------+--------+--------+--------+
//! |          Identity (UTF-8)         |
//! +--------+--------+--------+--------+
//! ```
//! The dialing side speaks first.

use crate::tunnel::PeerId;
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Magic bytes opening every tunnel link
pub const MAGIC: [u8; 4] = *b"BFRT";

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Longest identity accepted in a hello
pub const MAX_IDENTITY_LEN: usize = 255;

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 10;

/// Which side of the handshake we play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Dialed the link; sends its hello first
    Initiator,
    /// Accepted the link; answers the initiator's hello
    Responder,
}

/// Encode a hello carrying `identity`
pub fn encode_hello(identity: &PeerId) -> Result<BytesMut, ProtocolError> {
    let id = identity.as_str().as_bytes();
    validate_identity_len(id.len())?;

    let mut buf = BytesMut::with_capacity(MAGIC.len() + 3 + id.len());
    buf.extend_from_slice(&MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(id.len() as u16);
    buf.extend_from_slice(id);
    Ok(buf)
}

/// Read and validate the remote hello
pub async fn read_hello<R>(reader: &mut R) -> Result<PeerId, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 7];
    reader.read_exact(&mut header).await?;

    if header[..4] != MAGIC {
        return Err(ProtocolError::InvalidMagic);
    }

    if header[4] != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: header[4],
        });
    }

    let len = u16::from_be_bytes([header[5], header[6]]) as usize;
    validate_identity_len(len)?;

    let mut id = vec![0u8; len];
    reader.read_exact(&mut id).await?;

    String::from_utf8(id)
        .map(PeerId::from)
        .map_err(|_| ProtocolError::InvalidIdentity("not valid UTF-8".to_string()))
}

fn validate_identity_len(len: usize) -> Result<(), ProtocolError> {
    if len == 0 {
        return Err(ProtocolError::InvalidIdentity("empty".to_string()));
    }
    if len > MAX_IDENTITY_LEN {
        return Err(ProtocolError::InvalidIdentity(format!(
            "{} bytes exceeds {}",
            len, MAX_IDENTITY_LEN
        )));
    }
    Ok(())
}

/// Exchange identities over a freshly opened link.
///
/// Returns the identity announced by the remote end.
pub async fn handshake<S>(
    stream: &mut S,
    local: &PeerId,
    role: HandshakeRole,
) -> Result<PeerId, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let hello = encode_hello(local)?;

        let remote = match role {
            HandshakeRole::Initiator => {
                stream.write_all(&hello).await?;
                stream.flush().await?;
                read_hello(stream).await?
            }
            HandshakeRole::Responder => {
                let remote = read_hello(stream).await?;
                stream.write_all(&hello).await?;
                stream.flush().await?;
                remote
            }
        };

        if &remote == local {
            return Err(ProtocolError::HandshakeFailed(format!(
                "remote announced our own identity '{}'",
                remote
            )));
        }
        Ok::<_, ProtocolError>(remote)
    };

    tokio::time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT), exchange)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_exchanges_identities() {
        let (mut a, mut b) = duplex(1024);

        let responder = tokio::spawn(async move {
            handshake(&mut b, &PeerId::from("edge"), HandshakeRole::Responder).await
        });

        let seen_by_initiator = handshake(&mut a, &PeerId::from("core"), HandshakeRole::Initiator)
            .await
            .unwrap();
        let seen_by_responder = responder.await.unwrap().unwrap();

        assert_eq!(seen_by_initiator, PeerId::from("edge"));
        assert_eq!(seen_by_responder, PeerId::from("core"));
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let err = read_hello(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMagic));
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (mut a, mut b) = duplex(1024);
        let mut hello = encode_hello(&PeerId::from("old")).unwrap();
        hello[4] = PROTOCOL_VERSION + 1;
        a.write_all(&hello).await.unwrap();

        let err = read_hello(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { actual, .. } if actual == PROTOCOL_VERSION + 1));
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(matches!(
            encode_hello(&PeerId::from("")),
            Err(ProtocolError::InvalidIdentity(_))
        ));
    }

    #[tokio::test]
    async fn test_own_identity_rejected() {
        let (mut a, mut b) = duplex(1024);

        let responder = tokio::spawn(async move {
            handshake(&mut b, &PeerId::from("same"), HandshakeRole::Responder).await
        });

        let err = handshake(&mut a, &PeerId::from("same"), HandshakeRole::Initiator)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeFailed(_)));
        assert!(responder.await.unwrap().is_err());
    }
}
