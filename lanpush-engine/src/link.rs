use std::time::Duration;

use lanpush_core::crypto::{EncryptionContext, predict_cipher_length};
use lanpush_core::error::{CryptoError, ProtocolError, TransferError};
use lanpush_core::listener::Connection;
use lanpush_core::protocol::{Opcode, Packet, min_len};

/// Low-level failure of a [`Link`] operation.
#[derive(Debug)]
pub enum LinkError {
    SendTimeout(Duration),
    ReceiveTimeout(Duration),
    Send(anyhow::Error),
    Receive(anyhow::Error),
    Invalid(ProtocolError),
    Crypto(CryptoError),
}

impl LinkError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::SendTimeout(_) | Self::ReceiveTimeout(_))
    }
}

impl From<LinkError> for TransferError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::SendTimeout(d) => {
                Self::Send(format!("write timed out after {} ms", d.as_millis()))
            }
            LinkError::ReceiveTimeout(d) => {
                Self::Receive(format!("no response within {} ms", d.as_millis()))
            }
            LinkError::Send(e) => Self::Send(format!("{e:#}")),
            LinkError::Receive(e) => Self::Receive(format!("{e:#}")),
            LinkError::Invalid(e) => e.into(),
            LinkError::Crypto(e) => e.into(),
        }
    }
}

impl From<ProtocolError> for LinkError {
    fn from(e: ProtocolError) -> Self {
        Self::Invalid(e)
    }
}

impl From<CryptoError> for LinkError {
    fn from(e: CryptoError) -> Self {
        Self::Crypto(e)
    }
}

/// Packet-level, deadline-bounded I/O over a [`Connection`].
///
/// Every read and write is bounded by the link timeout unless the call
/// takes an explicit one. Handshake packets go out in the clear; transfer
/// packets and chunks go through the optional cipher.
pub struct Link<'a, C> {
    conn: &'a mut C,
    timeout: Duration,
}

impl<'a, C: Connection> Link<'a, C> {
    pub fn new(conn: &'a mut C, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        match tokio::time::timeout(self.timeout, self.conn.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::Send(e)),
            Err(_) => Err(LinkError::SendTimeout(self.timeout)),
        }
    }

    pub async fn read_exact(&mut self, buf: &mut [u8], wait: Duration) -> Result<(), LinkError> {
        match tokio::time::timeout(wait, self.conn.read_exact(buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::Receive(e)),
            Err(_) => Err(LinkError::ReceiveTimeout(wait)),
        }
    }

    /// Sends a handshake packet unencrypted.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), LinkError> {
        let bytes = packet.encode()?;
        self.write(&bytes).await
    }

    pub async fn send_control(&mut self, opcode: Opcode) -> Result<(), LinkError> {
        self.send(&Packet::Control(opcode)).await
    }

    /// Receives one handshake packet, waiting at most `wait` for each part.
    ///
    /// The opcode is read first; the rest of the packet is sized from it.
    pub async fn recv(&mut self, wait: Duration) -> Result<Packet, LinkError> {
        let mut opcode = [0u8; 1];
        self.read_exact(&mut opcode, wait).await?;
        let op = Opcode::try_from(opcode[0])?;

        let mut buf = vec![opcode[0]];
        match op {
            Opcode::SendPass => {
                let mut len = [0u8; 1];
                self.read_exact(&mut len, self.timeout).await?;
                buf.push(len[0]);
                let mut proof = vec![0u8; usize::from(len[0])];
                self.read_exact(&mut proof, self.timeout).await?;
                buf.extend_from_slice(&proof);
            }
            op => {
                let needed = min_len(op).ok_or(ProtocolError::UnexpectedOpcode(opcode[0]))?;
                let mut rest = vec![0u8; needed - 1];
                self.read_exact(&mut rest, self.timeout).await?;
                buf.extend_from_slice(&rest);
            }
        }
        Ok(Packet::decode(&buf)?)
    }

    /// Sends a fixed-size transfer packet, encrypted whole when a cipher is set.
    pub async fn send_sealed(
        &mut self,
        packet: &Packet,
        cipher: Option<&EncryptionContext>,
    ) -> Result<(), LinkError> {
        let bytes = packet.encode()?;
        self.send_chunk(&bytes, cipher).await
    }

    /// Receives a transfer packet whose plaintext is `plain_len` bytes.
    pub async fn recv_sealed(
        &mut self,
        plain_len: usize,
        cipher: Option<&EncryptionContext>,
    ) -> Result<Packet, LinkError> {
        let bytes = self.recv_chunk(plain_len, cipher).await?;
        Ok(Packet::decode(&bytes)?)
    }

    /// Writes one chunk, encrypting it on its own when a cipher is set.
    pub async fn send_chunk(
        &mut self,
        plain: &[u8],
        cipher: Option<&EncryptionContext>,
    ) -> Result<(), LinkError> {
        match cipher {
            Some(cipher) => self.write(&cipher.encrypt(plain)).await,
            None => self.write(plain).await,
        }
    }

    /// Reads one chunk of `plain_len` plaintext bytes, accounting for the
    /// padding added by encryption.
    pub async fn recv_chunk(
        &mut self,
        plain_len: usize,
        cipher: Option<&EncryptionContext>,
    ) -> Result<Vec<u8>, LinkError> {
        let wire_len = if cipher.is_some() {
            predict_cipher_length(plain_len)
        } else {
            plain_len
        };
        let mut buf = vec![0u8; wire_len];
        self.read_exact(&mut buf, self.timeout).await?;

        let Some(cipher) = cipher else {
            return Ok(buf);
        };
        let plain = cipher.decrypt(&buf)?;
        if plain.len() != plain_len {
            return Err(LinkError::Invalid(ProtocolError::TooShort {
                needed: plain_len,
                got: plain.len(),
            }));
        }
        Ok(plain)
    }

    pub async fn shutdown(&mut self) {
        let _ = tokio::time::timeout(self.timeout, self.conn.shutdown()).await;
    }
}
