use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{
    config::Config,
    internal,
    listener::{Listener, SHUTDOWN_GRACE},
    logging,
    relay::{Relay, UpstreamRelay},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

pub struct Controller {
    config: Arc<Config>,
    relay: Arc<dyn Relay>,
}

async fn shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                internal!(level = INFO, "CTRL+C entered, shutting down");
            }
            _ = terminate.recv() => {
                internal!(level = INFO, "Terminate signal received, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        internal!(level = INFO, "CTRL+C entered, shutting down");
    }

    Ok(())
}

impl Controller {
    /// A controller relaying over the network.
    pub fn new(config: Config) -> Self {
        Self::with_relay(config, UpstreamRelay::network())
    }

    pub fn with_relay(config: Config, relay: Arc<dyn Relay>) -> Self {
        Self {
            config: Arc::new(config),
            relay,
        }
    }

    /// Run the proxy until SIGINT or SIGTERM, then drain open sessions.
    ///
    /// # Errors
    ///
    /// This function will return an error if the listen address cannot be
    /// bound or the signal handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(self.config.log_level.into());

        internal!(
            level = INFO,
            "Starting SMTP proxy: listen {}, upstream {}:{}, envelope sender {}",
            self.config.listen_addr,
            self.config.upstream.host,
            self.config.upstream.port,
            self.config.envelope_from
        );

        let listener = Listener::new(Arc::clone(&self.config), Arc::clone(&self.relay));
        let socket = listener.bind().await?;

        let (sender, receiver) = broadcast::channel(16);
        let server = listener.serve(socket, receiver);
        tokio::pin!(server);

        tokio::select! {
            () = &mut server => {
                internal!(level = WARN, "Listener stopped unexpectedly");
                return Ok(());
            }
            result = shutdown() => result?,
        }

        internal!(
            level = INFO,
            "Shutting down, waiting up to {:?} for open sessions",
            SHUTDOWN_GRACE
        );
        let _ = sender.send(Signal::Shutdown);
        server.await;

        internal!(level = INFO, "Server stopped");
        Ok(())
    }
}
