//! Drives one client connection: reads commands, feeds the [`Session`] and
//! writes replies.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    auth::{Mechanism, Step},
    error::SessionError,
    incoming, internal, outgoing,
    session::Session,
};

use super::{
    command::{Command, HeloVariant},
    connection::{Connection, ConnectionError},
    extensions::Extension,
    status::{EnhancedCode, Reply, Status},
};

/// Applied to every read and write on the client connection.
pub const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Recipients accepted per transaction.
pub const MAX_RECIPIENTS: usize = 100;

const OK: Reply = Reply::new(Status::Ok, EnhancedCode(2, 0, 0), "OK");
const SEND_HELO_FIRST: Reply = Reply::new(
    Status::InvalidCommandSequence,
    EnhancedCode(5, 5, 1),
    "Send EHLO/HELO first",
);

enum Flow {
    Continue,
    Quit,
}

pub struct Handler<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    connection: Connection<Stream>,
    session: Session,
    /// Set once EHLO or HELO has been accepted.
    greeting: Option<HeloVariant>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Handler<Stream> {
    pub fn new(stream: Stream, session: Session) -> Self {
        Self::with_timeout(stream, session, IO_TIMEOUT)
    }

    pub fn with_timeout(stream: Stream, session: Session, timeout: Duration) -> Self {
        Self {
            connection: Connection::new(stream, timeout),
            session,
            greeting: None,
        }
    }

    /// Serve the connection until the client quits, disconnects or idles out.
    ///
    /// # Errors
    ///
    /// Transport failures other than a clean close or an idle timeout.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;
        self.session.logout();

        match result {
            Err(ConnectionError::Closed) => Ok(()),
            other => other,
        }
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let greeting = Reply::plain(
            Status::ServiceReady,
            format!("{} ESMTP Service Ready", self.session.config().server_domain),
        );
        self.reply(&greeting).await?;

        loop {
            let flow = match self.connection.receive().await {
                Ok(Some(line)) => self.dispatch(&line).await,
                Ok(None) => return Ok(()),
                Err(err) => Err(err),
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => return Ok(()),
                Err(ConnectionError::LineTooLong) => {
                    self.reply(&Reply::new(Status::Syntax, EnhancedCode(5, 5, 2), "Line too long"))
                        .await?;
                }
                Err(ConnectionError::Timeout(after)) => {
                    internal!(level = DEBUG, "Client idle for {:?}, closing", after);
                    let _ = self
                        .reply(&Reply::new(Status::Unavailable, EnhancedCode(4, 4, 2), "Idle timeout"))
                        .await;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        outgoing!("{}", reply);
        self.connection.send(reply).await
    }

    async fn reject(&mut self, err: &SessionError) -> Result<Flow, ConnectionError> {
        self.reply(&err.reply()).await?;
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, line: &str) -> Result<Flow, ConnectionError> {
        let command = match Command::try_from(line) {
            Ok(command) => command,
            Err(Command::Syntax(reason)) => {
                incoming!("{}", line);
                internal!(level = DEBUG, "Syntax error: {}", reason);
                self.reply(&Reply::new(
                    Status::ArgumentSyntax,
                    EnhancedCode(5, 5, 4),
                    "Syntax error in parameters or arguments",
                ))
                .await?;
                return Ok(Flow::Continue);
            }
            Err(_) => {
                incoming!("{}", line);
                self.reply(&Reply::new(
                    Status::Syntax,
                    EnhancedCode(5, 5, 2),
                    "Syntax error, command unrecognized",
                ))
                .await?;
                return Ok(Flow::Continue);
            }
        };

        // The Display impl leaves out AUTH initial responses
        incoming!("{}", command);

        match command {
            Command::Helo(variant) => self.helo(variant).await,
            Command::Noop => {
                self.reply(&OK).await?;
                Ok(Flow::Continue)
            }
            Command::Rset => {
                self.session.reset();
                self.reply(&OK).await?;
                Ok(Flow::Continue)
            }
            Command::Quit => {
                self.reply(&Reply::new(Status::GoodBye, EnhancedCode(2, 0, 0), "Bye"))
                    .await?;
                Ok(Flow::Quit)
            }
            _ if self.greeting.is_none() => {
                self.reply(&SEND_HELO_FIRST).await?;
                Ok(Flow::Continue)
            }
            Command::Auth { mechanism, initial } => self.auth(&mechanism, initial).await,
            Command::MailFrom { from, size } => self.mail(from, size).await,
            Command::RcptTo(to) => self.rcpt(&to).await,
            Command::Data => self.data().await,
            Command::Syntax(_) | Command::Invalid(_) => Ok(Flow::Continue),
        }
    }

    async fn helo(&mut self, variant: HeloVariant) -> Result<Flow, ConnectionError> {
        self.session.reset();

        let domain = self.session.config().server_domain.clone();
        match variant {
            HeloVariant::Ehlo(_) => {
                let mut lines = vec![domain];
                lines.extend(
                    Extension::advertised(self.session.config().max_message_size)
                        .iter()
                        .map(ToString::to_string),
                );

                outgoing!("{:?}", lines);
                self.connection.send_multiline(Status::Ok, &lines).await?;
            }
            HeloVariant::Helo(_) => {
                self.reply(&Reply::plain(Status::Ok, domain)).await?;
            }
        }

        self.greeting = Some(variant);
        Ok(Flow::Continue)
    }

    async fn auth(&mut self, mechanism: &str, initial: Option<String>) -> Result<Flow, ConnectionError> {
        if !matches!(self.greeting, Some(HeloVariant::Ehlo(_))) {
            self.reply(&Reply::new(
                Status::InvalidCommandSequence,
                EnhancedCode(5, 5, 1),
                "Send EHLO first",
            ))
            .await?;
            return Ok(Flow::Continue);
        }

        let mechanism = match mechanism.parse::<Mechanism>() {
            Ok(mechanism) => mechanism,
            Err(err) => return self.reject(&SessionError::from(err)).await,
        };

        let mut exchange = match self.session.begin_auth(mechanism) {
            Ok(exchange) => exchange,
            Err(err) => return self.reject(&err).await,
        };

        let mut response = match initial.as_deref() {
            None => None,
            Some("=") => Some(Vec::new()),
            Some(encoded) => match STANDARD.decode(encoded) {
                Ok(decoded) => Some(decoded),
                Err(_) => return self.invalid_base64().await,
            },
        };

        loop {
            match self.session.advance_auth(exchange.as_mut(), response.as_deref()) {
                Ok(Step::Done) => {
                    self.reply(&Reply::new(
                        Status::AuthSuccessful,
                        EnhancedCode(2, 7, 0),
                        "Authentication successful",
                    ))
                    .await?;
                    return Ok(Flow::Continue);
                }
                Ok(Step::Challenge(challenge)) => {
                    self.reply(&Reply::plain(Status::AuthChallenge, STANDARD.encode(challenge)))
                        .await?;
                }
                Err(err) => return self.reject(&err).await,
            }

            // Client responses carry credentials and are not logged.
            let Some(line) = self.connection.receive().await? else {
                return Ok(Flow::Quit);
            };

            if line.trim() == "*" {
                self.reply(&Reply::new(
                    Status::ArgumentSyntax,
                    EnhancedCode(5, 0, 0),
                    "Authentication cancelled",
                ))
                .await?;
                return Ok(Flow::Continue);
            }

            response = match STANDARD.decode(line.trim()) {
                Ok(decoded) => Some(decoded),
                Err(_) => return self.invalid_base64().await,
            };
        }
    }

    async fn invalid_base64(&mut self) -> Result<Flow, ConnectionError> {
        self.reply(&Reply::new(
            Status::ArgumentSyntax,
            EnhancedCode(5, 5, 2),
            "Invalid base64 data",
        ))
        .await?;
        Ok(Flow::Continue)
    }

    async fn mail(&mut self, from: Option<String>, size: Option<usize>) -> Result<Flow, ConnectionError> {
        if self.session.is_authenticated() && self.session.sender().is_some() {
            self.reply(&Reply::new(
                Status::InvalidCommandSequence,
                EnhancedCode(5, 5, 1),
                "Nested MAIL command",
            ))
            .await?;
            return Ok(Flow::Continue);
        }

        let max = self.session.config().max_message_size;
        if size.is_some_and(|size| size > max) {
            return self.reject(&SessionError::MessageTooLarge { max }).await;
        }

        match self.session.declare_sender(from.as_deref().unwrap_or_default()) {
            Ok(()) => {
                self.reply(&Reply::new(Status::Ok, EnhancedCode(2, 1, 0), "Sender OK"))
                    .await?;
                Ok(Flow::Continue)
            }
            Err(err) => self.reject(&err).await,
        }
    }

    async fn rcpt(&mut self, to: &str) -> Result<Flow, ConnectionError> {
        if self.session.is_authenticated() && self.session.sender().is_none() {
            self.reply(&Reply::new(
                Status::InvalidCommandSequence,
                EnhancedCode(5, 5, 1),
                "Missing MAIL FROM command",
            ))
            .await?;
            return Ok(Flow::Continue);
        }

        if self.session.recipients().len() >= MAX_RECIPIENTS {
            self.reply(&Reply::new(
                Status::InsufficientStorage,
                EnhancedCode(4, 5, 3),
                "Too many recipients",
            ))
            .await?;
            return Ok(Flow::Continue);
        }

        match self.session.declare_recipient(to) {
            Ok(()) => {
                self.reply(&Reply::new(Status::Ok, EnhancedCode(2, 1, 5), "Recipient OK"))
                    .await?;
                Ok(Flow::Continue)
            }
            Err(err) => self.reject(&err).await,
        }
    }

    async fn data(&mut self) -> Result<Flow, ConnectionError> {
        if let Err(err) = self.session.check_ready() {
            return self.reject(&err).await;
        }

        self.reply(&Reply::plain(
            Status::StartMailInput,
            "Start mail input; end with <CRLF>.<CRLF>",
        ))
        .await?;

        let data = self
            .connection
            .receive_data(self.session.config().max_message_size)
            .await?;

        incoming!("<message data, {} bytes>", data.len());

        match self.session.submit_message(data.as_slice()).await {
            Ok(()) => {
                self.reply(&Reply::new(
                    Status::Ok,
                    EnhancedCode(2, 0, 0),
                    "Message accepted for delivery",
                ))
                .await?;
                Ok(Flow::Continue)
            }
            Err(err) => self.reject(&err).await,
        }
    }
}
