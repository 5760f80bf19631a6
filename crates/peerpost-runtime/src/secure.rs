//! Noise-secured byte streams
//!
//! Connections are authenticated with a `Noise_XX_25519_ChaChaPoly_SHA256`
//! handshake keyed by the account's X25519 agreement key. Each side sends its
//! Ed25519 public key as handshake payload; it must map to the static key the
//! handshake authenticated, which binds the connection to an account identity.
//!
//! After the handshake the stream carries Noise transport records:
//!
//! ```text
//! [length: u16 BE] [ciphertext + tag: length bytes]
//! ```
//!
//! [`SecureReader`] and [`SecureWriter`] wrap the two halves of a split stream and
//! expose plain [`AsyncRead`]/[`AsyncWrite`], each keeping its own nonce counter.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::ready;
use snow::{Builder, HandshakeState, StatelessTransportState};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use peerpost_core::crypto::edwards_to_montgomery;
use peerpost_core::{
    CryptographicError, IdentityKeyPair, PeerId, PeerpostError, PublicKeyHex, Result,
    TransportError,
};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Protocol identifier mixed into the handshake prologue
pub const PROTOCOL_ID: &str = "/peerpost/chat/1.0.0";
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";
const MAX_NOISE_MESSAGE: usize = 65535;
const TAG_LEN: usize = 16;
/// Largest plaintext carried by one transport record
pub const MAX_RECORD_PLAINTEXT: usize = MAX_NOISE_MESSAGE - TAG_LEN;

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

/// Which side of the handshake the local host plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// The authenticated identity on the far side of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub public_key: PublicKeyHex,
    pub peer_id: PeerId,
}

/// Result of a completed handshake
pub struct Established {
    pub remote: RemoteIdentity,
    pub(crate) transport: Arc<StatelessTransportState>,
}

impl core::fmt::Debug for Established {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Established")
            .field("remote", &self.remote)
            .field("transport", &"<StatelessTransportState>")
            .finish()
    }
}

fn build_handshake(identity: &IdentityKeyPair, role: Role) -> Result<HandshakeState> {
    let params = NOISE_PATTERN.parse()?;
    let private_key = identity.agreement_secret().to_bytes();
    let builder = Builder::new(params)
        .local_private_key(&private_key)
        .prologue(PROTOCOL_ID.as_bytes());
    let state = match role {
        Role::Initiator => builder.build_initiator()?,
        Role::Responder => builder.build_responder()?,
    };
    Ok(state)
}

async fn send_handshake<S>(stream: &mut S, state: &mut HandshakeState, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut message = vec![0u8; MAX_NOISE_MESSAGE];
    let len = state.write_message(payload, &mut message)?;
    stream.write_all(&(len as u16).to_be_bytes()).await?;
    stream.write_all(&message[..len]).await?;
    stream.flush().await?;
    Ok(())
}

async fn recv_handshake<S>(stream: &mut S, state: &mut HandshakeState) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut message = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut message).await?;
    let mut payload = vec![0u8; MAX_NOISE_MESSAGE];
    let n = state.read_message(&message, &mut payload)?;
    payload.truncate(n);
    Ok(payload)
}

/// Check the remote's Ed25519 payload against its authenticated static key
fn authenticate(payload: &[u8], state: &HandshakeState) -> Result<RemoteIdentity> {
    let public_key: [u8; 32] = payload
        .try_into()
        .map_err(|_| CryptographicError::InvalidKeyFormat)?;
    let peer_id = PeerId::from_public_key(public_key);
    let expected_static = edwards_to_montgomery(&public_key)?;
    match state.get_remote_static() {
        Some(remote_static) if remote_static == expected_static.as_slice() => Ok(RemoteIdentity {
            public_key: PublicKeyHex::from_bytes(&public_key),
            peer_id,
        }),
        _ => Err(TransportError::AuthenticationFailed {
            peer_id: peer_id.to_string(),
        }
        .into()),
    }
}

/// Run the XX handshake over `stream`
///
/// The initiator sends `-> e`, the responder answers `<- e, ee, s, es` with its
/// public key, and the initiator finishes with `-> s, se` carrying its own.
pub async fn handshake<S>(stream: &mut S, identity: &IdentityKeyPair, role: Role) -> Result<Established>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = build_handshake(identity, role)?;
    let local_key = identity.public_key_bytes();

    let remote = match role {
        Role::Initiator => {
            send_handshake(stream, &mut state, &[]).await?;
            let payload = recv_handshake(stream, &mut state).await?;
            let remote = authenticate(&payload, &state)?;
            send_handshake(stream, &mut state, &local_key).await?;
            remote
        }
        Role::Responder => {
            recv_handshake(stream, &mut state).await?;
            send_handshake(stream, &mut state, &local_key).await?;
            let payload = recv_handshake(stream, &mut state).await?;
            authenticate(&payload, &state)?
        }
    };

    if !state.is_handshake_finished() {
        return Err(PeerpostError::handshake_failed(
            remote.peer_id.to_string(),
            "handshake did not complete",
        ));
    }
    debug!(peer = %remote.peer_id.short(), ?role, "noise handshake complete");
    let transport = state.into_stateless_transport_mode()?;
    Ok(Established {
        remote,
        transport: Arc::new(transport),
    })
}

/// Wrap split stream halves with the established transport
pub fn secure_halves<R, W>(
    established: &Established,
    reader: R,
    writer: W,
) -> (SecureReader<R>, SecureWriter<W>) {
    (
        SecureReader::new(reader, established.transport.clone()),
        SecureWriter::new(writer, established.transport.clone()),
    )
}

fn noise_io_error(err: snow::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

// ----------------------------------------------------------------------------
// Secure Reader
// ----------------------------------------------------------------------------

/// Decrypting read half
pub struct SecureReader<R> {
    inner: R,
    transport: Arc<StatelessTransportState>,
    nonce: u64,
    header: [u8; 2],
    header_filled: usize,
    record: Vec<u8>,
    record_filled: usize,
    plaintext: Vec<u8>,
    plaintext_pos: usize,
}

impl<R> SecureReader<R> {
    fn new(inner: R, transport: Arc<StatelessTransportState>) -> Self {
        Self {
            inner,
            transport,
            nonce: 0,
            header: [0u8; 2],
            header_filled: 0,
            record: Vec::new(),
            record_filled: 0,
            plaintext: Vec::new(),
            plaintext_pos: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    /// Read and decrypt the next record; `false` on a clean end of stream
    fn poll_next_record(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        while self.header_filled < self.header.len() {
            let mut buf = ReadBuf::new(&mut self.header[self.header_filled..]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
            let n = buf.filled().len();
            if n == 0 {
                if self.header_filled == 0 {
                    return Poll::Ready(Ok(false));
                }
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            self.header_filled += n;
        }

        let len = u16::from_be_bytes(self.header) as usize;
        self.record.resize(len, 0);
        while self.record_filled < len {
            let mut buf = ReadBuf::new(&mut self.record[self.record_filled..]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
            let n = buf.filled().len();
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            self.record_filled += n;
        }

        let mut plaintext = vec![0u8; len];
        let n = self
            .transport
            .read_message(self.nonce, &self.record, &mut plaintext)
            .map_err(noise_io_error)?;
        plaintext.truncate(n);
        self.nonce += 1;
        self.plaintext = plaintext;
        self.plaintext_pos = 0;
        self.header_filled = 0;
        self.record_filled = 0;
        Poll::Ready(Ok(true))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SecureReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.plaintext_pos < this.plaintext.len() {
                let available = &this.plaintext[this.plaintext_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.plaintext_pos += n;
                return Poll::Ready(Ok(()));
            }
            if !ready!(this.poll_next_record(cx))? {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Secure Writer
// ----------------------------------------------------------------------------

/// Encrypting write half
pub struct SecureWriter<W> {
    inner: W,
    transport: Arc<StatelessTransportState>,
    nonce: u64,
    pending: Vec<u8>,
    written: usize,
}

impl<W> SecureWriter<W> {
    fn new(inner: W, transport: Arc<StatelessTransportState>) -> Self {
        Self {
            inner,
            transport,
            nonce: 0,
            pending: Vec::new(),
            written: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SecureWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_RECORD_PLAINTEXT);
        let mut record = vec![0u8; n + TAG_LEN];
        let len = this
            .transport
            .write_message(this.nonce, &buf[..n], &mut record)
            .map_err(noise_io_error)?;
        this.nonce += 1;
        this.pending.extend_from_slice(&(len as u16).to_be_bytes());
        this.pending.extend_from_slice(&record[..len]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair(
        alice: &IdentityKeyPair,
        bob: &IdentityKeyPair,
    ) -> (
        (Established, tokio::io::DuplexStream),
        (Established, tokio::io::DuplexStream),
    ) {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let (left, right) = tokio::join!(
            handshake(&mut a, alice, Role::Initiator),
            handshake(&mut b, bob, Role::Responder)
        );
        ((left.unwrap(), a), (right.unwrap(), b))
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let ((at_alice, _), (at_bob, _)) = connected_pair(&alice, &bob).await;

        assert_eq!(at_alice.remote.public_key, bob.public_key_hex());
        assert_eq!(at_alice.remote.peer_id, bob.peer_id());
        assert_eq!(at_bob.remote.public_key, alice.public_key_hex());
        assert_eq!(at_bob.remote.peer_id, alice.peer_id());
    }

    #[tokio::test]
    async fn test_large_writes_span_records() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let ((at_alice, a), (at_bob, b)) = connected_pair(&alice, &bob).await;

        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let (_, mut alice_writer) = secure_halves(&at_alice, a_read, a_write);
        let (mut bob_reader, _) = secure_halves(&at_bob, b_read, b_write);

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            alice_writer.write_all(&sent).await.unwrap();
            alice_writer.flush().await.unwrap();
        });

        let mut received = vec![0u8; payload.len()];
        bob_reader.read_exact(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_mismatched_payload_rejected() {
        // A payload naming a different Ed25519 key than the static key used.
        let honest = IdentityKeyPair::generate();
        let impostor_key = IdentityKeyPair::generate().public_key_bytes();
        let mut responder = build_handshake(&honest, Role::Responder).unwrap();
        let mut initiator = build_handshake(&IdentityKeyPair::generate(), Role::Initiator).unwrap();

        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let mut out = vec![0u8; MAX_NOISE_MESSAGE];
        let n = initiator.write_message(&[], &mut buf).unwrap();
        responder.read_message(&buf[..n], &mut out).unwrap();
        let n = responder.write_message(&impostor_key, &mut buf).unwrap();
        let m = initiator.read_message(&buf[..n], &mut out).unwrap();

        assert!(matches!(
            authenticate(&out[..m], &initiator),
            Err(PeerpostError::Transport(TransportError::AuthenticationFailed { .. }))
        ));
        assert!(authenticate(&honest.public_key_bytes(), &initiator).is_ok());
    }
}
