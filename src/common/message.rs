//! Wire messages exchanged between clients, the coordinator and replicas.
//!
//! One message per TCP connection: the sender writes a single JSON document
//! and half-closes its write side, the receiver reads to EOF. Keys and values
//! travel base64-encoded so arbitrary bytes survive the JSON framing.

use crate::common::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest decoded key a replica accepts.
pub const MAX_KEY_SIZE: usize = 256;

/// Largest decoded value a replica accepts (128 KiB).
pub const MAX_VALUE_SIZE: usize = 128 * 1024;

/// Cap on a single framed message. Well above the value limit so oversized
/// values still reach a replica and are refused with a vote, not a dropped
/// connection.
pub const MAX_FRAME_SIZE: u64 = 4 * 1024 * 1024;

/// Cap on a client request, leaving room for the fields the coordinator adds
/// when forwarding it to a replica.
pub const MAX_CLIENT_FRAME_SIZE: u64 = MAX_FRAME_SIZE - 1024;

pub const SUCCESS: &str = "Success";
pub const KEY_NOT_FOUND: &str = "Does not exist";
pub const OVERSIZED_KEY: &str = "Oversized key";
pub const OVERSIZED_VALUE: &str = "Oversized value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    GetReq,
    PutReq,
    DelReq,
    Resp,
    Ready,
    Abort,
    Commit,
    Ack,
    Register,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::GetReq => "getreq",
            MessageType::PutReq => "putreq",
            MessageType::DelReq => "delreq",
            MessageType::Resp => "resp",
            MessageType::Ready => "ready",
            MessageType::Abort => "abort",
            MessageType::Commit => "commit",
            MessageType::Ack => "ack",
            MessageType::Register => "register",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of write carried by a 2PC transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Delete,
}

impl OpKind {
    /// Ready-request type for this kind.
    pub fn request_type(&self) -> MessageType {
        match self {
            OpKind::Put => MessageType::PutReq,
            OpKind::Delete => MessageType::DelReq,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Put => f.write_str("put"),
            OpKind::Delete => f.write_str("delete"),
        }
    }
}

/// Logical message `{type, key?, value?, message?, op_id?, status?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<bool>,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            key: None,
            value: None,
            message: None,
            op_id: None,
            status: None,
        }
    }

    pub fn get_request(key: &[u8]) -> Self {
        Self::new(MessageType::GetReq).with_key(key)
    }

    pub fn put_request(key: &[u8], value: &[u8]) -> Self {
        Self::new(MessageType::PutReq).with_key(key).with_value(value)
    }

    pub fn del_request(key: &[u8]) -> Self {
        Self::new(MessageType::DelReq).with_key(key)
    }

    /// Phase-1 ready request for operation `op_id`.
    pub fn ready_request(op_id: u64, kind: OpKind, key: &[u8], value: Option<&[u8]>) -> Self {
        let msg = Self::new(kind.request_type())
            .with_key(key)
            .with_op_id(op_id);
        match value {
            Some(value) => msg.with_value(value),
            None => msg,
        }
    }

    /// `resp` carrying a human-readable message.
    pub fn response(message: impl Into<String>) -> Self {
        Self::new(MessageType::Resp).with_message(message)
    }

    /// `resp` carrying a value read for `key`.
    pub fn value_response(key: &[u8], value: &[u8]) -> Self {
        Self::new(MessageType::Resp).with_key(key).with_value(value)
    }

    pub fn register(registration: impl Into<String>) -> Self {
        Self::new(MessageType::Register).with_message(registration)
    }

    pub fn ready(op_id: u64) -> Self {
        Self::new(MessageType::Ready).with_op_id(op_id)
    }

    pub fn abort(op_id: u64, reason: impl Into<String>) -> Self {
        Self::new(MessageType::Abort)
            .with_op_id(op_id)
            .with_message(reason)
    }

    /// Phase-2 decision.
    pub fn decision(op_id: u64, commit: bool) -> Self {
        let msg_type = if commit {
            MessageType::Commit
        } else {
            MessageType::Abort
        };
        Self::new(msg_type).with_op_id(op_id)
    }

    pub fn ack(op_id: u64) -> Self {
        Self::new(MessageType::Ack).with_op_id(op_id)
    }

    pub fn with_key(mut self, key: &[u8]) -> Self {
        self.key = Some(BASE64.encode(key));
        self
    }

    pub fn with_value(mut self, value: &[u8]) -> Self {
        self.value = Some(BASE64.encode(value));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_op_id(mut self, op_id: u64) -> Self {
        self.op_id = Some(op_id);
        self
    }

    pub fn with_status(mut self, status: bool) -> Self {
        self.status = Some(status);
        self
    }

    /// Decoded key; missing or malformed keys are protocol errors.
    pub fn decode_key(&self) -> Result<Vec<u8>> {
        decode_field("key", self.key.as_deref())
    }

    /// Decoded value, if one was sent.
    pub fn decode_value(&self) -> Result<Option<Vec<u8>>> {
        self.value
            .as_deref()
            .map(|v| decode_field("value", Some(v)))
            .transpose()
    }

    pub fn require_op_id(&self) -> Result<u64> {
        self.op_id
            .ok_or_else(|| Error::Protocol(format!("{} message without op_id", self.msg_type)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("unparseable message: {}", e)))
    }

    /// Write this message and half-close the write side.
    pub async fn send<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Read one message: everything until the peer half-closes.
    pub async fn receive<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        Self::receive_within(reader, MAX_FRAME_SIZE).await
    }

    /// Like `receive`, with an explicit frame cap. A longer message fails with
    /// `FrameTooLarge` and its remainder is left unread.
    pub async fn receive_within<R: AsyncRead + Unpin>(reader: &mut R, limit: u64) -> Result<Self> {
        let mut buf = Vec::new();
        let mut limited = reader.take(limit + 1);
        limited.read_to_end(&mut buf).await?;
        if buf.len() as u64 > limit {
            return Err(Error::FrameTooLarge(limit));
        }
        if buf.is_empty() {
            return Err(Error::Network("connection closed without a message".into()));
        }
        Self::from_bytes(&buf)
    }

    /// Dial `addr`, send this message and wait for the single reply.
    /// The whole exchange is bounded by `deadline`.
    pub async fn exchange(&self, addr: &str, deadline: Duration) -> Result<Message> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::Network(format!("could not connect to {}: {}", addr, e)))?;
            let (mut reader, mut writer) = stream.split();
            self.send(&mut writer)
                .await
                .map_err(|e| Error::Network(format!("could not send to {}: {}", addr, e)))?;
            Message::receive(&mut reader).await.map_err(|e| match e {
                Error::Io(io) => Error::Network(format!("could not receive from {}: {}", addr, io)),
                other => other,
            })
        };
        tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| Error::Timeout(format!("{} did not answer within {:?}", addr, deadline)))?
    }
}

fn decode_field(name: &str, field: Option<&str>) -> Result<Vec<u8>> {
    let raw = field.ok_or_else(|| Error::Protocol(format!("missing {}", name)))?;
    BASE64
        .decode(raw)
        .map_err(|e| Error::Protocol(format!("malformed {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_on_the_wire() {
        let json = String::from_utf8(Message::ready(3).to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"ready","op_id":3}"#);

        let parsed = Message::from_bytes(br#"{"type":"delreq","key":"aw=="}"#).unwrap();
        assert_eq!(parsed.msg_type, MessageType::DelReq);
        assert_eq!(parsed.decode_key().unwrap(), b"k");
    }

    #[test]
    fn test_binary_payloads() {
        let msg = Message::put_request(&[0, 1, 2, 255], &[9; 300]);
        let parsed = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.decode_key().unwrap(), vec![0, 1, 2, 255]);
        assert_eq!(parsed.decode_value().unwrap().unwrap(), vec![9; 300]);
    }

    #[test]
    fn test_protocol_errors() {
        assert!(matches!(
            Message::from_bytes(b"<KVMessage/>"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Message::from_bytes(br#"{"type":"bogus"}"#),
            Err(Error::Protocol(_))
        ));
        let no_key = Message::new(MessageType::GetReq);
        assert!(matches!(no_key.decode_key(), Err(Error::Protocol(_))));
        let bad_key = Message {
            key: Some("***".into()),
            ..Message::new(MessageType::GetReq)
        };
        assert!(matches!(bad_key.decode_key(), Err(Error::Protocol(_))));
        assert!(Message::new(MessageType::Commit).require_op_id().is_err());
    }

    #[test]
    fn test_decision_types() {
        assert_eq!(Message::decision(1, true).msg_type, MessageType::Commit);
        assert_eq!(Message::decision(1, false).msg_type, MessageType::Abort);
    }

    #[tokio::test]
    async fn test_send_and_receive_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Message::put_request(b"key", b"value").with_op_id(7);
        let expected = sent.clone();
        let writer = tokio::spawn(async move { sent.send(&mut a).await });
        let received = Message::receive(&mut b).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_exchange_against_echo_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            let req = Message::receive(&mut r).await.unwrap();
            Message::ack(req.op_id.unwrap()).send(&mut w).await.unwrap();
        });
        let reply = Message::decision(11, true)
            .exchange(&addr, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, Message::ack(11));
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let result = Message::ready(1)
            .exchange(&addr, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_receive_rejects_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            let junk = vec![b'x'; MAX_FRAME_SIZE as usize + 10];
            let _ = a.write_all(&junk).await;
            let _ = a.shutdown().await;
        });
        let result = Message::receive(&mut b).await;
        drop(b);
        assert!(matches!(result, Err(Error::FrameTooLarge(MAX_FRAME_SIZE))));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_within_custom_limit() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::put_request(b"k", &[1; 64]);
        let writer = tokio::spawn(async move { msg.send(&mut a).await });
        let result = Message::receive_within(&mut b, 16).await;
        assert!(matches!(result, Err(Error::FrameTooLarge(16))));
        drop(b);
        let _ = writer.await.unwrap();
    }
}
