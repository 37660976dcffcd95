use crate::connection::{Connection, ConnectionId};
use crate::{MqError, Result};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// TCP listener that hands out [`Connection`]s until cancelled.
pub struct Listener {
    inner: Option<TcpListener>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    next_id: ConnectionId,
    max_message_size: usize,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        cancel: CancellationToken,
        max_message_size: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| MqError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Some(listener),
            local_addr,
            cancel,
            next_id: 1,
            max_message_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next peer. Fails with [`MqError::ListenerClosed`] once the
    /// listener has been closed or cancelled.
    pub async fn accept(&mut self) -> Result<Connection<TcpStream>> {
        let accepted = {
            let Some(listener) = self.inner.as_ref() else {
                return Err(MqError::ListenerClosed);
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = listener.accept() => Some(result),
            }
        };

        let Some(result) = accepted else {
            self.close();
            return Err(MqError::ListenerClosed);
        };
        let (stream, peer) = result?;
        if let Err(e) = optimize_client_socket(&stream) {
            warn!("Failed to optimize client socket {}: {}", peer, e);
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!("Accepted connection {} from {}", id, peer);
        Ok(Connection::new(
            id,
            peer.to_string(),
            stream,
            self.max_message_size,
        ))
    }

    /// Release the socket. Later `accept` calls fail with `ListenerClosed`.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!("Listener on {} closed", self.local_addr);
        }
    }
}

fn optimize_client_socket(stream: &TcpStream) -> std::io::Result<()> {
    use socket2::SockRef;

    let socket_ref = SockRef::from(stream);
    socket_ref.set_nodelay(true)?;
    socket_ref.set_keepalive(true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let cancel = CancellationToken::new();
        let first = Listener::bind("127.0.0.1:0", cancel.clone(), 16).await.unwrap();
        let taken = first.local_addr().to_string();

        match Listener::bind(&taken, cancel, 16).await {
            Err(MqError::Bind { addr, .. }) => assert_eq!(addr, taken),
            Err(e) => panic!("Expected Bind error, got {}", e),
            Ok(_) => panic!("Expected Bind error"),
        }
    }

    #[tokio::test]
    async fn test_accept_fails_after_cancel() {
        let cancel = CancellationToken::new();
        let mut listener = Listener::bind("127.0.0.1:0", cancel.clone(), 16)
            .await
            .unwrap();

        cancel.cancel();
        assert!(matches!(listener.accept().await, Err(MqError::ListenerClosed)));
        assert!(matches!(listener.accept().await, Err(MqError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_accept_assigns_increasing_ids() {
        let cancel = CancellationToken::new();
        let mut listener = Listener::bind("127.0.0.1:0", cancel, 16).await.unwrap();
        let addr = listener.local_addr();

        let _a = TcpStream::connect(addr).await.unwrap();
        let first = listener.accept().await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        let second = listener.accept().await.unwrap();
        assert!(second.id() > first.id());
    }
}
