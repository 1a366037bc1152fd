//! Scripted upstream SMTP server for relay and end-to-end tests.
//!
//! Speaks just enough submission SMTP for the proxy's client side: EHLO,
//! `AUTH PLAIN` with an initial response, MAIL, RCPT, DATA and QUIT. Every
//! command line and every message body it receives is recorded.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
    time::timeout,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    Ehlo(String),
    Auth { username: String, password: String },
    MailFrom(String),
    RcptTo(String),
    Data,
    Quit,
    Other(String),
}

#[derive(Debug, Default)]
struct Recorded {
    commands: Vec<UpstreamCommand>,
    messages: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Behaviour {
    accept_auth: bool,
    rcpt_code: u16,
    /// Accept connections but never write a byte.
    silent: bool,
    /// Close the connection on QUIT instead of answering 221.
    drop_on_quit: bool,
}

pub struct MockUpstream {
    addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
    task: JoinHandle<()>,
}

pub struct MockUpstreamBuilder {
    behaviour: Behaviour,
}

impl MockUpstreamBuilder {
    #[must_use]
    pub const fn reject_auth(mut self) -> Self {
        self.behaviour.accept_auth = false;
        self
    }

    #[must_use]
    pub const fn silent(mut self) -> Self {
        self.behaviour.silent = true;
        self
    }

    #[must_use]
    pub const fn drop_on_quit(mut self) -> Self {
        self.behaviour.drop_on_quit = true;
        self
    }

    #[must_use]
    pub const fn with_rcpt_code(mut self, code: u16) -> Self {
        self.behaviour.rcpt_code = code;
        self
    }

    pub async fn start(self) -> MockUpstream {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock upstream");
        let addr = listener.local_addr().expect("Mock upstream has no address");
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let behaviour = self.behaviour;
        let shared = Arc::clone(&recorded);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let behaviour = behaviour.clone();
                let recorded = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = handle_client(stream, behaviour, recorded).await;
                });
            }
        });

        MockUpstream {
            addr,
            recorded,
            task,
        }
    }
}

impl MockUpstream {
    #[must_use]
    pub const fn builder() -> MockUpstreamBuilder {
        MockUpstreamBuilder {
            behaviour: Behaviour {
                accept_auth: true,
                rcpt_code: 250,
                silent: false,
                drop_on_quit: false,
            },
        }
    }

    pub async fn start() -> Self {
        Self::builder().start().await
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<UpstreamCommand> {
        self.recorded.lock().await.commands.clone()
    }

    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.recorded.lock().await.messages.clone()
    }

    /// Wait until a QUIT has been recorded, or give up after `limit`.
    pub async fn wait_for_quit(&self, limit: Duration) -> bool {
        timeout(limit, async {
            loop {
                if self.commands().await.contains(&UpstreamCommand::Quit) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn decode_plain(token: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(token).ok()?;
    let mut parts = decoded.split(|byte| *byte == 0);
    let _authzid = parts.next()?;
    let username = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let password = String::from_utf8(parts.next()?.to_vec()).ok()?;
    Some((username, password))
}

async fn handle_client(
    mut stream: TcpStream,
    behaviour: Behaviour,
    recorded: Arc<Mutex<Recorded>>,
) -> std::io::Result<()> {
    if behaviour.silent {
        // Hold the socket open until the peer gives up.
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
        return Ok(());
    }

    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(b"220 mock.upstream ESMTP\r\n").await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let command_line = line.trim_end();
        let (verb, rest) = command_line
            .split_once(' ')
            .unwrap_or((command_line, ""));

        let (reply, command): (String, UpstreamCommand) = match verb.to_ascii_uppercase().as_str() {
            "EHLO" => (
                "250-mock.upstream\r\n250-AUTH PLAIN\r\n250 SIZE 10000\r\n".to_string(),
                UpstreamCommand::Ehlo(rest.to_string()),
            ),
            "AUTH" => {
                let token = rest.strip_prefix("PLAIN ").unwrap_or_default();
                let (username, password) = decode_plain(token).unwrap_or_default();
                let reply = if behaviour.accept_auth {
                    "235 2.7.0 Authentication successful\r\n"
                } else {
                    "535 5.7.8 Authentication credentials invalid\r\n"
                };
                (reply.to_string(), UpstreamCommand::Auth { username, password })
            }
            "MAIL" => (
                "250 2.1.0 OK\r\n".to_string(),
                UpstreamCommand::MailFrom(rest.to_string()),
            ),
            "RCPT" => (
                format!("{} Recipient\r\n", behaviour.rcpt_code),
                UpstreamCommand::RcptTo(rest.to_string()),
            ),
            "DATA" => ("354 Go ahead\r\n".to_string(), UpstreamCommand::Data),
            "QUIT" => {
                recorded.lock().await.commands.push(UpstreamCommand::Quit);
                if !behaviour.drop_on_quit {
                    writer.write_all(b"221 2.0.0 Bye\r\n").await?;
                }
                return Ok(());
            }
            _ => (
                "500 5.5.2 Unknown command\r\n".to_string(),
                UpstreamCommand::Other(command_line.to_string()),
            ),
        };

        let is_data = command == UpstreamCommand::Data;
        recorded.lock().await.commands.push(command);
        writer.write_all(reply.as_bytes()).await?;

        if is_data {
            let mut message = Vec::new();
            let mut data_line = Vec::new();

            loop {
                data_line.clear();
                if reader.read_until(b'\n', &mut data_line).await? == 0 {
                    return Ok(());
                }
                if data_line == b".\r\n" {
                    break;
                }
                let unstuffed = data_line.strip_prefix(b".").unwrap_or(&data_line);
                message.extend_from_slice(unstuffed);
            }

            recorded.lock().await.messages.push(message);
            writer.write_all(b"250 2.0.0 Queued\r\n").await?;
        }
    }
}
