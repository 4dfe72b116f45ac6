//! Distributed mode protocol
//!
//! This module defines the messages exchanged between a searching client and
//! a permuter server. Messages are MessagePack (rmp-serde) encoded so that
//! target specs and feedback travel with their full serde representation.
//!
//! # Message Flow
//!
//! ```text
//! Client                               Server
//!   |                                    |
//!   |-------- CONFIG(targets) ---------->|
//!   |<------- READY(num_workers) --------|   or ERROR
//!   |                                    |
//!   |-------- EVALUATE(id, seed) ------->|   up to num_workers in flight
//!   |<------- RESULT(id, feedback) ------|
//!   |              ...                   |
//!   |-------- STOP --------------------->|
//! ```
//!
//! A one-off vouch uses its own short exchange:
//!
//! ```text
//!   |-------- VOUCH(grantee) ----------->|
//!   |<------- VOUCH_ACK -----------------|   or ERROR
//! ```
//!
//! # Message Framing
//!
//! Each message is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack message]
//! ```

use crate::eval::TargetSpec;
use crate::seed::Seed;
use crate::worker::channel::Feedback;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Client and server must match.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted message body
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Client → Server: targets to evaluate and requested share
    Config(ConfigMessage),

    /// Server → Client: accepted, with this many evaluation slots
    Ready(ReadyMessage),

    /// Client → Server: evaluate one seed
    Evaluate(EvaluateMessage),

    /// Server → Client: outcome of one `Evaluate`
    Result(ResultMessage),

    /// Client → Server: no more requests will follow
    Stop,

    /// Either direction: the session cannot continue
    Error(ErrorMessage),

    /// Client → Server: add a client to the server's allow-list
    Vouch(VouchMessage),

    /// Server → Client: vouch recorded
    VouchAck,
}

/// Session setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMessage {
    pub protocol_version: u32,

    /// Client identifier (hostname)
    pub client_id: String,

    /// Requested share of the server, relative to other clients
    pub priority: f64,

    /// Every target of the run, indexed as in `Evaluate`, without any
    /// compile script or mutator command
    pub targets: Vec<TargetSpec>,
}

/// Session accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub protocol_version: u32,

    /// Server identifier (hostname)
    pub server_id: String,

    /// Evaluations the client may keep in flight
    pub num_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateMessage {
    pub request_id: u64,
    pub target: usize,
    pub seed: Seed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub request_id: u64,
    /// `Scored` or `EvalError`
    pub feedback: Feedback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VouchMessage {
    pub client_id: String,
    /// Client to allow from now on
    pub grantee: String,
}

/// Serialize a message to bytes
///
/// Prepends a 4-byte length field for framing.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg).context("Failed to serialize message")?;
    if msg_bytes.len() > MAX_MESSAGE_LEN {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_bytes.len());
    }

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Read one complete message
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_LEN {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    let msg = rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")?;

    Ok(msg)
}

/// Write one message and flush it
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = serialize_message(msg)?;

    writer.write_all(&framed).await.context("Failed to write message")?;
    writer.flush().await.context("Failed to flush stream")?;

    Ok(())
}

/// Host name used to identify this side of a session
pub fn local_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Candidate;

    #[tokio::test]
    async fn test_ready_round_trip() {
        let msg = Message::Ready(ReadyMessage {
            protocol_version: PROTOCOL_VERSION,
            server_id: "10.0.1.10".to_string(),
            num_workers: 16,
        });

        let bytes = serialize_message(&msg).unwrap();
        match read_message(&mut &bytes[..]).await.unwrap() {
            Message::Ready(ready) => {
                assert_eq!(ready.protocol_version, PROTOCOL_VERSION);
                assert_eq!(ready.server_id, "10.0.1.10");
                assert_eq!(ready.num_workers, 16);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[tokio::test]
    async fn test_result_carries_candidate() {
        let msg = Message::Result(ResultMessage {
            request_id: 42,
            feedback: Feedback::Scored {
                target: 1,
                candidate: Candidate {
                    score: Some(120),
                    hash: Some("abc".to_string()),
                    source: None,
                    ..Candidate::default()
                },
            },
        });

        let bytes = serialize_message(&msg).unwrap();
        match read_message(&mut &bytes[..]).await.unwrap() {
            Message::Result(result) => {
                assert_eq!(result.request_id, 42);
                match result.feedback {
                    Feedback::Scored { target, candidate } => {
                        assert_eq!(target, 1);
                        assert_eq!(candidate.score, Some(120));
                        assert_eq!(candidate.hash.as_deref(), Some("abc"));
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_message_framing() {
        let msg = Message::Stop;
        let bytes = serialize_message(&msg).unwrap();

        assert!(bytes.len() >= 4);
        let msg_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + msg_len);
    }

    #[tokio::test]
    async fn test_incomplete_message_rejected() {
        let bytes = serialize_message(&Message::VouchAck).unwrap();
        assert!(read_message(&mut &bytes[..bytes.len() - 1]).await.is_err());
        assert!(read_message(&mut &bytes[..2]).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let msg = Message::Evaluate(EvaluateMessage {
            request_id: 7,
            target: 0,
            seed: Seed::new(5, 10),
        });
        write_message(&mut client, &msg).await.unwrap();
        write_message(&mut client, &Message::Stop).await.unwrap();

        match read_message(&mut server).await.unwrap() {
            Message::Evaluate(eval) => {
                assert_eq!(eval.request_id, 7);
                assert_eq!(eval.seed, Seed::new(5, 10));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(read_message(&mut server).await.unwrap(), Message::Stop));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_LEN as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &len).await.unwrap();

        assert!(read_message(&mut server).await.is_err());
    }
}
