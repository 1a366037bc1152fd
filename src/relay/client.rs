//! A minimal SMTP submission client: greeting, EHLO, optional STARTTLS,
//! AUTH PLAIN and a single mail transaction.

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio_rustls::{TlsConnector, rustls::pki_types::ServerName};

use crate::{auth::Credentials, internal};

use super::{
    error::{ClientError, Result},
    response::Response,
};

/// Upper bound on a single reply line from the server.
const MAX_LINE_LENGTH: u64 = 4096;

/// Name announced in EHLO.
pub const CLIENT_NAME: &str = "localhost";

/// Anything the client can speak SMTP over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    stream: BufStream<Box<dyn Stream>>,
    host: String,
}

impl SmtpClient {
    /// Wrap an established connection to `host`. Nothing is read yet.
    pub fn new(stream: impl Stream + 'static, host: impl Into<String>) -> Self {
        Self {
            stream: BufStream::new(Box::new(stream)),
            host: host.into(),
        }
    }

    /// Reads the initial server greeting (220 response).
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is not a 220.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await?.expect(220)
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        self.read_response().await
    }

    /// Sends EHLO with the specified domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or the server refuses it.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await?.expect(250)
    }

    /// Sends STARTTLS and upgrades the connection, verifying the server as
    /// the host this client was created for.
    ///
    /// The caller has to send EHLO again afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses STARTTLS or the handshake fails.
    pub async fn starttls(self, connector: &TlsConnector) -> Result<Self> {
        let mut client = self;
        client.command("STARTTLS").await?.expect(220)?;

        let server_name = ServerName::try_from(client.host.clone())
            .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

        let stream = client.stream.into_inner();
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::new(stream, client.host))
    }

    /// Authenticates with `AUTH PLAIN` and an initial response.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer 235.
    pub async fn auth_plain(&mut self, credentials: &Credentials) -> Result<Response> {
        let token = STANDARD.encode(format!(
            "\0{}\0{}",
            credentials.username(),
            credentials.password()
        ));

        internal!("Authenticating upstream as {}", credentials.username());

        self.command(&format!("AUTH PLAIN {token}")).await?.expect(235)
    }

    /// Runs one complete transaction: MAIL, one RCPT per recipient, DATA and
    /// the dot-stuffed message.
    ///
    /// # Errors
    ///
    /// Returns an error as soon as the server refuses any step.
    pub async fn send_mail(&mut self, from: &str, recipients: &[String], message: &[u8]) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>"))
            .await?
            .expect_success()?;

        for recipient in recipients {
            self.command(&format!("RCPT TO:<{recipient}>"))
                .await?
                .expect_success()?;
        }

        self.command("DATA").await?.expect(354)?;

        self.stream.write_all(&dot_stuff(message)).await?;
        self.stream.flush().await?;

        self.read_response().await?.expect(250)
    }

    /// Sends QUIT command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await?.expect(221)
    }

    /// Reads a complete, possibly multi-line, SMTP response from the server.
    async fn read_response(&mut self) -> Result<Response> {
        let mut code = None;
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = (&mut self.stream)
                .take(MAX_LINE_LENGTH)
                .read_line(&mut line)
                .await?;

            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            if !line.ends_with('\n') {
                return Err(ClientError::ParseError(format!(
                    "Response line exceeds {MAX_LINE_LENGTH} bytes"
                )));
            }

            let parsed = Response::parse_line(line.trim_end_matches(['\r', '\n']))?;

            match code {
                Some(code) if code != parsed.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Response::new(parsed.code, lines));
            }
        }
    }
}

/// Escape leading dots and append the end-of-data marker.
fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(message.len() + 8);
    let mut line_start = true;

    for &byte in message {
        if line_start && byte == b'.' {
            output.push(b'.');
        }
        output.push(byte);
        line_start = byte == b'\n';
    }

    if !output.is_empty() && !output.ends_with(b"\r\n") {
        output.extend_from_slice(b"\r\n");
    }
    output.extend_from_slice(b".\r\n");

    output
}
