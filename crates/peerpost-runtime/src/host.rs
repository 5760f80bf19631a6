//! TCP host: listener plus authenticated dial/accept
//!
//! A [`Host`] is bound to one account identity. Both directions run the Noise
//! handshake under a timeout and yield a [`Connection`] whose remote identity has
//! been authenticated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use peerpost_core::{IdentityKeyPair, PeerId, PeerpostError, Result, TransportError};

use crate::secure::{handshake, secure_halves, Established, RemoteIdentity, Role, SecureReader, SecureWriter};

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// An authenticated stream to one remote identity
#[derive(Debug)]
pub struct Connection {
    established: Established,
    stream: TcpStream,
    initiated_locally: bool,
}

impl Connection {
    pub fn remote(&self) -> &RemoteIdentity {
        &self.established.remote
    }

    /// Whether the local host dialed this connection
    pub fn initiated_locally(&self) -> bool {
        self.initiated_locally
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Split into independently owned, encrypted halves
    pub fn into_split(
        self,
    ) -> (
        RemoteIdentity,
        SecureReader<OwnedReadHalf>,
        SecureWriter<OwnedWriteHalf>,
    ) {
        let (read, write) = self.stream.into_split();
        let (reader, writer) = secure_halves(&self.established, read, write);
        (self.established.remote, reader, writer)
    }
}

async fn secure(
    mut stream: TcpStream,
    identity: &IdentityKeyPair,
    role: Role,
    timeout: Duration,
) -> Result<Connection> {
    stream.set_nodelay(true)?;
    let established = tokio::time::timeout(timeout, handshake(&mut stream, identity, role))
        .await
        .map_err(|_| TransportError::Timeout {
            duration_ms: timeout.as_millis() as u64,
        })??;
    Ok(Connection {
        established,
        stream,
        initiated_locally: role == Role::Initiator,
    })
}

/// Dial `address` and require the far side to be `expected`
pub async fn dial(
    identity: &IdentityKeyPair,
    address: SocketAddr,
    expected: &PeerId,
    timeout: Duration,
) -> Result<Connection> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| TransportError::Timeout {
            duration_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| PeerpostError::connection_failed(expected.to_string(), e.to_string()))?;

    let connection = secure(stream, identity, Role::Initiator, timeout).await?;
    if &connection.remote().peer_id != expected {
        return Err(PeerpostError::identity_mismatch(
            expected.to_string(),
            connection.remote().peer_id.to_string(),
        ));
    }
    debug!(peer = %expected.short(), %address, "dialed peer");
    Ok(connection)
}

// ----------------------------------------------------------------------------
// Host
// ----------------------------------------------------------------------------

/// Listening endpoint for one account identity
#[derive(Debug)]
pub struct Host {
    identity: Arc<IdentityKeyPair>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Host {
    pub async fn bind(identity: Arc<IdentityKeyPair>, address: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        info!(peer = %identity.peer_id().short(), %local_addr, "host listening");
        Ok(Self {
            identity,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> &Arc<IdentityKeyPair> {
        &self.identity
    }

    /// Accept the next raw TCP connection
    ///
    /// The handshake is left to [`Host::secure_inbound`] so a slow peer cannot
    /// stall the accept loop.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        Ok(self.listener.accept().await?)
    }

    /// Run the responder handshake on an accepted stream
    pub async fn secure_inbound(
        identity: &IdentityKeyPair,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<Connection> {
        secure(stream, identity, Role::Responder, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_dial_and_accept() {
        let server_identity = Arc::new(IdentityKeyPair::generate());
        let client_identity = IdentityKeyPair::generate();
        let host = Host::bind(server_identity.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let address = host.local_addr();

        let accept = tokio::spawn(async move {
            let (stream, _) = host.accept().await.unwrap();
            Host::secure_inbound(host.identity(), stream, TIMEOUT).await.unwrap()
        });
        let outbound = dial(&client_identity, address, &server_identity.peer_id(), TIMEOUT)
            .await
            .unwrap();
        let inbound = accept.await.unwrap();

        assert!(outbound.initiated_locally());
        assert!(!inbound.initiated_locally());
        assert_eq!(inbound.remote().peer_id, client_identity.peer_id());

        let (_, _, mut writer) = outbound.into_split();
        let (_, mut reader, _) = inbound.into_split();
        writer.write_all(b"over noise").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over noise");
    }

    #[tokio::test]
    async fn test_dial_rejects_unexpected_identity() {
        let server_identity = Arc::new(IdentityKeyPair::generate());
        let host = Host::bind(server_identity, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let address = host.local_addr();
        tokio::spawn(async move {
            let (stream, _) = host.accept().await.unwrap();
            let _ = Host::secure_inbound(host.identity(), stream, TIMEOUT).await;
        });

        let someone_else = IdentityKeyPair::generate().peer_id();
        let result = dial(&IdentityKeyPair::generate(), address, &someone_else, TIMEOUT).await;
        assert!(matches!(result, Err(PeerpostError::Crypto(_))));
    }
}
