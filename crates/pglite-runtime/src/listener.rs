use std::io::ErrorKind;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bridge::MessageBridge;
use crate::error::PgLiteError;

/// Bytes read from a connection per request. Anything past this is dropped.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Raw TCP pass-through to the guest.
///
/// Each connection carries exactly one request: one read of at most
/// [`READ_BUFFER_SIZE`] bytes goes to the bridge, the guest's bytes come back,
/// and the connection is closed. This is not the PostgreSQL wire protocol and
/// ordinary Postgres clients will not work against it.
pub struct NetworkFront {
    listener: TcpListener,
    bridge: MessageBridge,
}

impl NetworkFront {
    pub async fn bind(addr: SocketAddr, bridge: MessageBridge) -> Result<Self, PgLiteError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PgLiteError::Listen(format!("{addr}: {e}")))?;
        Ok(Self { listener, bridge })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) {
        let addr = self.local_addr().ok();
        tracing::info!(addr = ?addr, "Network front listening");

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let bridge = self.bridge.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &bridge).await {
                            tracing::warn!(%peer, "Connection abandoned: {e}");
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!("Accept failed: {e}");
                }
                Err(e) => {
                    tracing::error!("Accept failed, stopping network front: {e}");
                    break;
                }
            }
        }

        tracing::info!(addr = ?addr, "Network front stopped");
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

/// Serve a single request on `stream`: one read, one guest round trip, one
/// write, close.
pub async fn handle_connection<S>(mut stream: S, bridge: &MessageBridge) -> Result<(), PgLiteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let read = stream.read(&mut buf).await?;
    if read == 0 {
        tracing::debug!("Peer closed before sending a request");
        return Ok(());
    }

    let response = bridge.exec_protocol(&buf[..read]).await?;
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}
