//! Delivery of sanitised messages to the configured upstream server.

pub mod client;
pub mod error;
pub mod response;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use crate::{
    config::{Config, Upstream},
    internal,
};

pub use self::{
    client::SmtpClient,
    error::{ClientError, RelayError},
};

pub const IMPLICIT_TLS_PORT: u16 = 465;
pub const SUBMISSION_PORT: u16 = 587;

/// Deadlines for each phase of an upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect, TLS handshake, greeting, EHLO and STARTTLS together.
    pub connect: Duration,
    pub auth: Duration,
    /// MAIL, every RCPT, DATA and the message itself.
    pub transmit: Duration,
    pub quit: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            auth: Duration::from_secs(60),
            transmit: Duration::from_secs(300),
            quit: Duration::from_secs(10),
        }
    }
}

async fn within<T>(
    step: &'static str,
    after: Duration,
    operation: impl Future<Output = error::Result<T>>,
) -> error::Result<T> {
    tokio::time::timeout(after, operation)
        .await
        .map_err(|_| ClientError::Timeout { step, after })?
}

/// The side effect a session hands a sanitised message to.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Deliver `message` to every recipient in `recipients`, using
    /// `config.envelope_from` as the envelope sender.
    ///
    /// # Errors
    ///
    /// Any failure to connect, authenticate or transmit.
    async fn send(
        &self,
        config: &Config,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), RelayError>;
}

/// How the connection to the upstream is secured, decided by port alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// TLS from the first byte.
    Implicit,
    /// Plain connection upgraded with `STARTTLS` before authenticating.
    StartTls,
    Plain,
}

impl TlsMode {
    #[must_use]
    pub const fn for_port(port: u16) -> Self {
        match port {
            IMPLICIT_TLS_PORT => Self::Implicit,
            SUBMISSION_PORT => Self::StartTls,
            _ => Self::Plain,
        }
    }
}

/// Opens a ready-to-authenticate session with the upstream: greeting read
/// and EHLO accepted, over whatever transport the strategy calls for.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn plain(&self, upstream: &Upstream) -> error::Result<SmtpClient>;

    async fn implicit_tls(&self, upstream: &Upstream) -> error::Result<SmtpClient>;

    async fn starttls(&self, upstream: &Upstream) -> error::Result<SmtpClient>;

    async fn dial(&self, upstream: &Upstream) -> error::Result<SmtpClient> {
        match TlsMode::for_port(upstream.port) {
            TlsMode::Implicit => self.implicit_tls(upstream).await,
            TlsMode::StartTls => self.starttls(upstream).await,
            TlsMode::Plain => self.plain(upstream).await,
        }
    }
}

/// Dials over TCP, verifying TLS peers against the platform's root store.
#[derive(Clone)]
pub struct NetworkDialer {
    connector: TlsConnector,
}

impl NetworkDialer {
    #[must_use]
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();

        let native = rustls_native_certs::load_native_certs();
        if !native.errors.is_empty() {
            internal!(
                level = WARN,
                "Some platform certificates could not be loaded: {:?}",
                native.errors
            );
        }

        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        internal!(
            level = DEBUG,
            "Loaded {} root certificates ({} ignored)",
            added,
            ignored
        );

        Self::with_roots(roots)
    }

    #[must_use]
    pub fn with_roots(roots: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    async fn handshake(mut client: SmtpClient) -> error::Result<SmtpClient> {
        client.read_greeting().await?;
        client.ehlo(client::CLIENT_NAME).await?;
        Ok(client)
    }
}

impl Default for NetworkDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for NetworkDialer {
    async fn plain(&self, upstream: &Upstream) -> error::Result<SmtpClient> {
        let stream = TcpStream::connect(upstream.address()).await?;
        Self::handshake(SmtpClient::new(stream, upstream.host.clone())).await
    }

    async fn implicit_tls(&self, upstream: &Upstream) -> error::Result<SmtpClient> {
        let server_name = ServerName::try_from(upstream.host.clone())
            .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

        let stream = TcpStream::connect(upstream.address()).await?;
        let stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Self::handshake(SmtpClient::new(stream, upstream.host.clone())).await
    }

    async fn starttls(&self, upstream: &Upstream) -> error::Result<SmtpClient> {
        let client = self.plain(upstream).await?;
        let mut client = client.starttls(&self.connector).await?;
        client.ehlo(client::CLIENT_NAME).await?;
        Ok(client)
    }
}

/// Relays each message over a fresh upstream session.
pub struct UpstreamRelay<D = NetworkDialer> {
    dialer: D,
    timeouts: Timeouts,
}

impl<D: Dialer> UpstreamRelay<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            timeouts: Timeouts::default(),
        }
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl UpstreamRelay {
    /// A relay dialing the real network.
    #[must_use]
    pub fn network() -> Arc<dyn Relay> {
        Arc::new(Self::new(NetworkDialer::new()))
    }
}

#[async_trait]
impl<D: Dialer> Relay for UpstreamRelay<D> {
    async fn send(
        &self,
        config: &Config,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), RelayError> {
        let upstream = &config.upstream;
        let address = upstream.address();

        internal!(
            level = DEBUG,
            "Dialing upstream {} ({:?})",
            address,
            TlsMode::for_port(upstream.port)
        );

        let timeouts = self.timeouts;

        let mut client = within("connect", timeouts.connect, self.dialer.dial(upstream))
            .await
            .map_err(|source| RelayError::Connect {
                address: address.clone(),
                source,
            })?;

        within("AUTH", timeouts.auth, client.auth_plain(&upstream.credentials))
            .await
            .map_err(|source| RelayError::Authenticate {
                address: address.clone(),
                source,
            })?;

        within(
            "transmit",
            timeouts.transmit,
            client.send_mail(&config.envelope_from, recipients, message),
        )
        .await
        .map_err(|source| RelayError::Transmit {
            address: address.clone(),
            source,
        })?;

        // The upstream has already accepted the message at this point.
        if let Err(err) = within("QUIT", timeouts.quit, client.quit()).await {
            internal!(level = WARN, "Upstream QUIT to {} failed: {}", address, err);
        }

        Ok(())
    }
}
