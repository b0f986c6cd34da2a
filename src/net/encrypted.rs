//! Encrypted framed streams over TCP.
//!
//! After the [`super::handshake`] completes, every logical message travels
//! as one or more frames `[u16 len][ciphertext]`; the plaintext of a frame
//! is `[more-flag][payload]` so messages larger than one frame are
//! fragmented and reassembled transparently, bounded by
//! [`MAX_FRAME_SIZE`]. Each direction has its own key and counter nonce,
//! so the two halves can run without shared state after a split.

use crate::constants::MAX_FRAME_SIZE;
use crate::keystore::KeyPair;
use crate::net::handshake::{
    HandshakeError, Initiator, MSG1_LEN, MSG2_LEN, Responder, SessionKeys,
};
use crate::types::PublicKeyBytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Handshake must complete within this.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const CHACHA_TAG_SIZE: usize = 16;

/// Largest single encrypted frame (u16 length prefix).
const MAX_TRANSPORT_FRAME: usize = u16::MAX as usize;

/// Payload per frame: frame minus tag and the more-flag byte.
const FRAME_PAYLOAD_MAX: usize = MAX_TRANSPORT_FRAME - CHACHA_TAG_SIZE - 1;

/// Reassembly bound; anything needing more frames than this is hostile.
const MAX_FRAGMENTS: usize = (MAX_FRAME_SIZE / FRAME_PAYLOAD_MAX) + 2;

#[derive(Debug, thiserror::Error)]
pub enum EncryptedError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("handshake timed out")]
    Timeout,

    #[error("peer key not in whitelist")]
    Unauthorized,
}

/// One direction of the transport: key plus counter nonce.
struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("counter", &self.counter)
            .finish()
    }
}

impl CipherState {
    fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        *Nonce::from_slice(&nonce)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "encrypt failed"))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "decrypt failed"))
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct EncryptedReader {
    reader: ReadHalf<TcpStream>,
    state: CipherState,
}

/// Sending half.
#[derive(Debug)]
pub struct EncryptedWriter {
    writer: WriteHalf<TcpStream>,
    state: CipherState,
}

/// An authenticated, encrypted connection.
#[derive(Debug)]
pub struct EncryptedStream {
    pub peer_addr: SocketAddr,
    /// The remote side's long-term public key, proven during handshake.
    pub remote_static: PublicKeyBytes,
    reader: EncryptedReader,
    writer: EncryptedWriter,
}

impl EncryptedStream {
    /// Connect side: we hold `our_pair` (the client long-term pair) and we
    /// already know the peer's server public key.
    pub async fn connect(
        stream: TcpStream,
        our_pair: &KeyPair,
        server_static: PublicKeyBytes,
    ) -> Result<Self, EncryptedError> {
        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            Self::connect_inner(stream, our_pair, server_static),
        )
        .await
        .map_err(|_| EncryptedError::Timeout)?
    }

    async fn connect_inner(
        stream: TcpStream,
        our_pair: &KeyPair,
        server_static: PublicKeyBytes,
    ) -> Result<Self, EncryptedError> {
        let peer_addr = stream.peer_addr()?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let initiator = Initiator::new(our_pair, server_static);
        let msg1 = initiator.write_msg1();
        write_handshake_msg(&mut writer, &msg1).await?;

        let msg2 = read_handshake_msg(&mut reader, MSG2_LEN).await?;
        let keys = initiator.read_msg2(&msg1, &msg2)?;

        debug!("outbound transport to {} established", peer_addr);
        Ok(Self::assemble(peer_addr, server_static, reader, writer, keys))
    }

    /// Accept side: we hold the server long-term pair; `allowed` is the
    /// whitelist check, consulted before we answer. Unknown keys never see
    /// message 2.
    pub async fn accept(
        stream: TcpStream,
        our_pair: &KeyPair,
        allowed: impl Fn(&PublicKeyBytes) -> bool,
    ) -> Result<Self, EncryptedError> {
        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            Self::accept_inner(stream, our_pair, allowed),
        )
        .await
        .map_err(|_| EncryptedError::Timeout)?
    }

    async fn accept_inner(
        stream: TcpStream,
        our_pair: &KeyPair,
        allowed: impl Fn(&PublicKeyBytes) -> bool,
    ) -> Result<Self, EncryptedError> {
        let peer_addr = stream.peer_addr()?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let msg1 = read_handshake_msg(&mut reader, MSG1_LEN).await?;
        let state = Responder::new(our_pair).read_msg1(&msg1)?;

        let client_static = state.initiator_static;
        if !allowed(&client_static) {
            return Err(EncryptedError::Unauthorized);
        }

        let (msg2, keys) = state.write_msg2();
        write_handshake_msg(&mut writer, &msg2).await?;

        debug!("inbound transport from {} established", peer_addr);
        Ok(Self::assemble(peer_addr, client_static, reader, writer, keys))
    }

    fn assemble(
        peer_addr: SocketAddr,
        remote_static: PublicKeyBytes,
        reader: ReadHalf<TcpStream>,
        writer: WriteHalf<TcpStream>,
        keys: SessionKeys,
    ) -> Self {
        Self {
            peer_addr,
            remote_static,
            reader: EncryptedReader {
                reader,
                state: CipherState::new(keys.recv),
            },
            writer: EncryptedWriter {
                writer,
                state: CipherState::new(keys.send),
            },
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write(data).await
    }

    pub async fn read(&mut self) -> io::Result<Vec<u8>> {
        self.reader.read().await
    }

    /// Split into independently owned halves (reader task + writer).
    pub fn split(self) -> (EncryptedReader, EncryptedWriter) {
        (self.reader, self.writer)
    }
}

impl EncryptedWriter {
    /// Encrypt and send one logical message, fragmenting as needed.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message too large: {} > {}", data.len(), MAX_FRAME_SIZE),
            ));
        }

        // Zero-length messages still produce one frame.
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(FRAME_PAYLOAD_MAX).collect()
        };
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.iter().enumerate() {
            let mut plain = Vec::with_capacity(1 + chunk.len());
            plain.push(u8::from(i != last));
            plain.extend_from_slice(chunk);

            let ciphertext = self.state.encrypt(&plain)?;
            let len = ciphertext.len() as u16;
            self.writer.write_all(&len.to_be_bytes()).await?;
            self.writer.write_all(&ciphertext).await?;
        }
        self.writer.flush().await
    }
}

impl EncryptedReader {
    /// Read and reassemble one logical message.
    pub async fn read(&mut self) -> io::Result<Vec<u8>> {
        let mut message = Vec::new();
        let mut fragments = 0;

        loop {
            fragments += 1;
            if fragments > MAX_FRAGMENTS {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "too many fragments",
                ));
            }

            let mut len_bytes = [0u8; 2];
            self.reader.read_exact(&mut len_bytes).await?;
            let len = u16::from_be_bytes(len_bytes) as usize;
            if len < CHACHA_TAG_SIZE + 1 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "runt frame"));
            }

            let mut ciphertext = vec![0u8; len];
            self.reader.read_exact(&mut ciphertext).await?;

            let plain = self.state.decrypt(&ciphertext)?;
            let (more, payload) = plain
                .split_first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty fragment"))?;

            if message.len() + payload.len() > MAX_FRAME_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "reassembled message too large",
                ));
            }
            message.extend_from_slice(payload);

            if *more == 0 {
                break;
            }
        }

        Ok(message)
    }
}

async fn write_handshake_msg<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &[u8],
) -> io::Result<()> {
    let len = msg.len() as u16;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(msg).await?;
    writer.flush().await
}

async fn read_handshake_msg<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    expected_len: usize,
) -> Result<Vec<u8>, EncryptedError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len != expected_len {
        return Err(HandshakeError::BadLength.into());
    }
    let mut msg = vec![0u8; len];
    reader.read_exact(&mut msg).await?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = async { listener.accept().await.unwrap().0 };
        let (c, s) = tokio::join!(client, server);
        (c.unwrap(), s)
    }

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let client_pair = KeyPair::generate();
        let server_pair = KeyPair::generate();
        let client_pub = client_pair.public();
        let server_pub = server_pair.public();

        let (c_stream, s_stream) = pair().await;

        let server = tokio::spawn(async move {
            let mut stream =
                EncryptedStream::accept(s_stream, &server_pair, |key| *key == client_pub)
                    .await
                    .unwrap();
            let msg = stream.read().await.unwrap();
            assert_eq!(msg, b"ping");
            stream.write(b"pong").await.unwrap();
        });

        let mut stream = EncryptedStream::connect(c_stream, &client_pair, server_pub)
            .await
            .unwrap();
        assert_eq!(stream.remote_static, server_pub);
        stream.write(b"ping").await.unwrap();
        assert_eq!(stream.read().await.unwrap(), b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn large_messages_fragment_and_reassemble() {
        let client_pair = KeyPair::generate();
        let server_pair = KeyPair::generate();
        let server_pub = server_pair.public();

        let (c_stream, s_stream) = pair().await;
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let server = tokio::spawn(async move {
            let mut stream = EncryptedStream::accept(s_stream, &server_pair, |_| true)
                .await
                .unwrap();
            let msg = stream.read().await.unwrap();
            assert_eq!(msg, expected);
        });

        let mut stream = EncryptedStream::connect(c_stream, &client_pair, server_pub)
            .await
            .unwrap();
        stream.write(&payload).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_client_is_rejected_before_msg2() {
        let client_pair = KeyPair::generate();
        let server_pair = KeyPair::generate();
        let server_pub = server_pair.public();

        let (c_stream, s_stream) = pair().await;

        let server = tokio::spawn(async move {
            let err = EncryptedStream::accept(s_stream, &server_pair, |_| false)
                .await
                .unwrap_err();
            assert!(matches!(err, EncryptedError::Unauthorized));
        });

        // The client never completes: the server hangs up instead of
        // sending message 2.
        let result = EncryptedStream::connect(c_stream, &client_pair, server_pub).await;
        server.await.unwrap();
        assert!(result.is_err());
    }
}
