//! The per-connection transaction state machine.
//!
//! A [`Session`] knows nothing about the wire: the protocol handler parses
//! commands and calls into it, and turns whatever [`SessionError`] comes back
//! into a reply with [`SessionError::reply`].

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    auth::{ChallengeResponse, Mechanism, Step},
    config::Config,
    error::SessionError,
    internal,
    relay::Relay,
    sanitizer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unauthenticated,
    /// Authenticated, no sender or recipients declared.
    Idle,
    InTransaction,
}

pub struct Session {
    authenticated: bool,
    /// Informational only; never used as the relayed envelope sender.
    sender: Option<String>,
    recipients: Vec<String>,
    config: Arc<Config>,
    relay: Arc<dyn Relay>,
}

impl Session {
    pub fn new(config: Arc<Config>, relay: Arc<dyn Relay>) -> Self {
        Self {
            authenticated: false,
            sender: None,
            recipients: Vec::new(),
            config,
            relay,
        }
    }

    pub fn state(&self) -> State {
        if !self.authenticated {
            State::Unauthenticated
        } else if self.sender.is_some() || !self.recipients.is_empty() {
            State::InTransaction
        } else {
            State::Idle
        }
    }

    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a fresh exchange for `mechanism`.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyAuthenticated`] if the session already is.
    pub fn begin_auth(&self, mechanism: Mechanism) -> Result<Box<dyn ChallengeResponse>, SessionError> {
        if self.authenticated {
            return Err(SessionError::AlreadyAuthenticated);
        }

        Ok(mechanism.exchange(&self.config.proxy))
    }

    /// Feed the client's response into `exchange`, marking the session
    /// authenticated once it completes.
    ///
    /// # Errors
    ///
    /// The exchange's failure, translated. A failed exchange is finished and
    /// must not be advanced again.
    pub fn advance_auth(
        &mut self,
        exchange: &mut dyn ChallengeResponse,
        response: Option<&[u8]>,
    ) -> Result<Step, SessionError> {
        let mechanism = exchange.mechanism();

        match exchange.next(response) {
            Ok(Step::Done) => {
                self.authenticated = true;
                internal!(level = INFO, "Client authenticated using {}", mechanism);
                Ok(Step::Done)
            }
            Ok(challenge) => Ok(challenge),
            Err(err) => {
                internal!(level = WARN, "Authentication failed using {}: {}", mechanism, err);
                Err(err.into())
            }
        }
    }

    /// Record the client's declared sender.
    ///
    /// # Errors
    ///
    /// [`SessionError::AuthRequired`] before authentication.
    pub fn declare_sender(&mut self, address: &str) -> Result<(), SessionError> {
        self.require_auth()?;

        internal!(
            level = DEBUG,
            "MAIL FROM: client sender {:?}, relay sender {:?}",
            address,
            self.config.envelope_from
        );

        self.sender = Some(address.to_string());
        Ok(())
    }

    /// Append a recipient. Duplicates are kept.
    ///
    /// # Errors
    ///
    /// [`SessionError::AuthRequired`] before authentication.
    pub fn declare_recipient(&mut self, address: &str) -> Result<(), SessionError> {
        self.require_auth()?;

        internal!(level = DEBUG, "RCPT TO: {:?}", address);

        self.recipients.push(address.to_string());
        Ok(())
    }

    /// Whether a message may be submitted right now.
    ///
    /// # Errors
    ///
    /// [`SessionError::AuthRequired`] or [`SessionError::NoRecipients`].
    pub fn check_ready(&self) -> Result<(), SessionError> {
        self.require_auth()?;

        if self.recipients.is_empty() {
            return Err(SessionError::NoRecipients);
        }

        Ok(())
    }

    /// Read the message from `reader`, sanitise it and relay it upstream.
    ///
    /// At most `max_message_size + 1` bytes are read. On success the
    /// transaction is cleared; after a relay failure it is kept so the client
    /// may retry.
    ///
    /// # Errors
    ///
    /// See [`SessionError`]. Relay failures are logged in full and reported
    /// as [`SessionError::RelayFailure`] without detail.
    pub async fn submit_message<R>(&mut self, reader: R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check_ready()?;

        let max = self.config.max_message_size;
        let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);

        let mut raw = Vec::new();
        reader.take(limit).read_to_end(&mut raw).await?;

        if raw.len() > max {
            internal!(level = WARN, "Rejected message larger than {} bytes", max);
            self.reset();
            return Err(SessionError::MessageTooLarge { max });
        }

        internal!(
            level = INFO,
            "Processing message: client sender {:?}, envelope sender {:?}, recipients {:?}, size {}",
            self.sender.as_deref().unwrap_or_default(),
            self.config.envelope_from,
            self.recipients,
            raw.len()
        );

        let sanitized = sanitizer::sanitize(&raw, &self.config.identifier_domain);

        if let Err(err) = self
            .relay
            .send(&self.config, &self.recipients, &sanitized)
            .await
        {
            internal!(level = ERROR, "Relay failed: {}", err);
            return Err(SessionError::RelayFailure);
        }

        internal!(
            level = INFO,
            "Message relayed from {:?} to {:?}",
            self.config.envelope_from,
            self.recipients
        );

        self.reset();
        Ok(())
    }

    /// Clear the transaction. Authentication is kept.
    pub fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    pub fn logout(self) {
        internal!(level = DEBUG, "Session closed in state {:?}", self.state());
    }

    fn require_auth(&self) -> Result<(), SessionError> {
        if self.authenticated {
            Ok(())
        } else {
            Err(SessionError::AuthRequired)
        }
    }
}
