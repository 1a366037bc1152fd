use std::{io, sync::Arc, time::Duration};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::{
    config::Config, controller::Signal, internal, relay::Relay, session::Session, smtp::Handler,
};

/// How long in-flight sessions get to finish once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

pub struct Listener {
    config: Arc<Config>,
    relay: Arc<dyn Relay>,
    grace: Duration,
}

impl Listener {
    pub fn new(config: Arc<Config>, relay: Arc<dyn Relay>) -> Self {
        Self {
            config,
            relay,
            grace: SHUTDOWN_GRACE,
        }
    }

    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// If the address is invalid or already in use.
    pub async fn bind(&self) -> Result<TcpListener, ListenerError> {
        TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| ListenerError::Bind {
                address: self.config.listen_addr.clone(),
                source,
            })
    }

    /// Accept connections, one task and one [`Session`] each, until a
    /// shutdown signal arrives; then wait (bounded by the grace period) for
    /// open sessions to finish.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: broadcast::Receiver<Signal>) {
        let address = listener
            .local_addr()
            .map_or_else(|_| self.config.listen_addr.clone(), |addr| addr.to_string());
        internal!(level = INFO, "Listening on {}", address);

        let mut sessions: Vec<JoinHandle<()>> = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        sessions.retain(|session| !session.is_finished());
                        internal!(
                            level = INFO,
                            "Listener {} received shutdown signal, finishing {} sessions ...",
                            address,
                            sessions.len()
                        );

                        if tokio::time::timeout(self.grace, join_all(sessions)).await.is_err() {
                            internal!(level = WARN, "Sessions still open after {:?}, abandoning them", self.grace);
                        }
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => {
                            internal!(level = WARN, "Failed to accept connection: {}", err);
                            continue;
                        }
                    };

                    internal!(level = DEBUG, "Connection received from {}", peer);

                    let session = Session::new(Arc::clone(&self.config), Arc::clone(&self.relay));
                    sessions.retain(|session| !session.is_finished());
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = Handler::new(stream, session).run().await {
                            internal!(level = ERROR, "Error serving {}: {}", peer, err);
                        }
                    }));
                }
            }
        }
    }
}
