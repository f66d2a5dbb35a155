//! Client library for the coordinator's client endpoint

use crate::common::crypt::EncryptedData;
use crate::common::message::{KEY_NOT_FOUND, SUCCESS};
use crate::common::{display_key, ClientConfig, Error, Message, MessageType, Result, ValueCipher};

pub struct KvClient {
    config: ClientConfig,
    cipher: Option<ValueCipher>,
}

impl KvClient {
    /// Fails only when an encryption key is configured and unusable.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let cipher = config
            .encryption_key
            .as_deref()
            .map(ValueCipher::from_master_key)
            .transpose()?;
        Ok(Self { config, cipher })
    }

    pub fn coordinator_addr(&self) -> &str {
        &self.config.coordinator_addr
    }

    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        let reply = self.send(Message::get_request(key)).await?;
        match reply.decode_value()? {
            Some(value) => self.open(value),
            None => match reply.message.as_deref() {
                Some(KEY_NOT_FOUND) => Err(Error::NotFound(display_key(key))),
                Some(reason) => Err(Error::ReadFailed(reason.to_string())),
                None => Err(Error::Protocol("resp without value or message".into())),
            },
        }
    }

    /// Returns whether `key` already existed.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        check_key(key)?;
        if value.is_empty() {
            return Err(Error::Validation("value must not be empty".into()));
        }
        let value = match &self.cipher {
            Some(cipher) => cipher.encrypt(value)?,
            None => value.to_vec(),
        };
        let reply = self.send(Message::put_request(key, &value)).await?;
        match reply.message.as_deref() {
            Some(SUCCESS) => Ok(reply.status.unwrap_or(false)),
            other => Err(write_failure(key, other)),
        }
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        let reply = self.send(Message::del_request(key)).await?;
        match reply.message.as_deref() {
            Some(SUCCESS) => Ok(()),
            other => Err(write_failure(key, other)),
        }
    }

    async fn send(&self, request: Message) -> Result<Message> {
        let reply = request
            .exchange(&self.config.coordinator_addr, self.config.request_timeout)
            .await?;
        if reply.msg_type != MessageType::Resp {
            return Err(Error::Protocol(format!("expected resp, got {}", reply.msg_type)));
        }
        Ok(reply)
    }

    fn open(&self, value: Vec<u8>) -> Result<Vec<u8>> {
        match &self.cipher {
            Some(cipher) if EncryptedData::is_encrypted(&value) => cipher.decrypt(&value),
            Some(_) => {
                tracing::warn!("Value was stored without encryption");
                Ok(value)
            }
            None => Ok(value),
        }
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("key must not be empty".into()));
    }
    Ok(())
}

fn write_failure(key: &[u8], message: Option<&str>) -> Error {
    match message {
        Some(KEY_NOT_FOUND) => Error::NotFound(display_key(key)),
        Some(reason) => Error::Aborted(reason.to_string()),
        None => Error::Protocol("resp without a message".into()),
    }
}
