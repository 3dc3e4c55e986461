//! TCP server for tracker connections.
//!
//! One task per accepted connection. Cancelling the server's token stops
//! the accept loop, cancels every in-flight connection (dropping its
//! socket), and waits for the connection tasks to finish before returning.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Per-protocol connection handler. Errors are scoped to the connection
/// and never stop the server.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub struct IngestServer<H> {
    listener: TcpListener,
    handler: Arc<H>,
}

impl<H: ConnectionHandler> IngestServer<H> {
    /// Bind the listener. The server is not accepting until `run`.
    pub async fn bind(addr: &str, handler: H) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the token cancels, then drain in-flight connections.
    pub async fn run(self, token: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!(%addr, "listening for tracker connections"),
            Err(_) => info!("listening for tracker connections"),
        }

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!(error = %err, "accept connection");
                            continue;
                        }
                    };
                    debug!(%peer, "accept connection");

                    let handler = self.handler.clone();
                    let connection_token = token.child_token();
                    connections.spawn(async move {
                        tokio::select! {
                            // Dropping the stream closes the socket.
                            _ = connection_token.cancelled() => {}
                            result = handler.handle(stream) => {
                                if let Err(err) = result {
                                    error!(%peer, error = %err, "handle connection");
                                }
                            }
                        }
                        debug!(%peer, "close connection");
                    });
                }
            }
        }

        // No new connections from here on; wait out the in-flight ones,
        // whose tokens were cancelled along with ours.
        drop(self.listener);
        while connections.join_next().await.is_some() {}
        info!("listener stopped");
    }
}
