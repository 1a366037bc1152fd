use core::fmt::{self, Display, Formatter};

use mailparse::MailAddr;

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    Auth {
        mechanism: String,
        /// Still base64 encoded; `=` stands for an empty response.
        initial: Option<String>,
    },
    /// A `from` of `None` is the null reverse-path, `MAIL FROM:<>`.
    MailFrom {
        from: Option<String>,
        size: Option<usize>,
    },
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    /// A known verb with arguments that do not parse.
    Syntax(String),
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(variant) => {
                let (HeloVariant::Ehlo(id) | HeloVariant::Helo(id)) = variant;
                write!(fmt, "{variant} {id}")
            }
            // Initial responses carry credentials and are never rendered.
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::MailFrom { from, .. } => {
                write!(fmt, "MAIL FROM:<{}>", from.as_deref().unwrap_or_default())
            }
            Self::RcptTo(to) => write!(fmt, "RCPT TO:<{to}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Syntax(s) | Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

/// Split `<path> params` (or a bare `path params`) into its parts.
fn split_path(argument: &str) -> Option<(&str, &str)> {
    let argument = argument.trim();

    if let Some(rest) = argument.strip_prefix('<') {
        let end = rest.find('>')?;
        Some((&rest[..end], rest[end + 1..].trim()))
    } else {
        let (path, params) = argument.split_once(' ').unwrap_or((argument, ""));
        Some((path, params.trim()))
    }
}

fn parse_mailbox(path: &str) -> Result<String, String> {
    let list = mailparse::addrparse(path).map_err(|e| e.to_string())?;

    match list.first() {
        Some(MailAddr::Single(info)) if list.len() == 1 => Ok(info.addr.clone()),
        _ => Err(format!("Expected a single mailbox, got '{path}'")),
    }
}

fn parse_size(params: &str) -> Result<Option<usize>, String> {
    params
        .split_whitespace()
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("SIZE"))
        .map(|(_, value)| {
            value
                .parse::<usize>()
                .map_err(|_| format!("Invalid SIZE value: {value}"))
        })
        .transpose()
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let comm = command.to_ascii_uppercase();
        let comm = comm.trim();

        if comm.starts_with("MAIL FROM:") {
            let Some((path, params)) = split_path(&command.trim()[10..]) else {
                return Err(Self::Syntax(command.to_owned()));
            };

            let size = parse_size(params).map_err(Self::Syntax)?;

            // Handle NULL sender explicitly, as mailparse doesn't tend to like this
            if path.is_empty() && command.contains("<>") {
                return Ok(Self::MailFrom { from: None, size });
            }

            parse_mailbox(path).map_or_else(
                |err| Err(Self::Syntax(err)),
                |from| {
                    Ok(Self::MailFrom {
                        from: Some(from),
                        size,
                    })
                },
            )
        } else if comm.starts_with("RCPT TO:") {
            match split_path(&command.trim()[8..]) {
                Some((path, _)) if !path.is_empty() => {
                    parse_mailbox(path).map_or_else(|e| Err(Self::Syntax(e)), |to| Ok(Self::RcptTo(to)))
                }
                _ => Err(Self::Syntax(command.to_owned())),
            }
        } else if comm.starts_with("EHLO") || comm.starts_with("HELO") {
            match command.trim().split_once(' ') {
                None => Err(Self::Syntax(format!("Expected hostname in {comm}"))),
                Some((_, host)) if comm.starts_with('H') => {
                    Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                }
                Some((_, host)) => Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))),
            }
        } else if comm == "AUTH" || comm.starts_with("AUTH ") {
            let mut parts = command.trim()[4..].split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(mechanism), initial, None) => Ok(Self::Auth {
                    mechanism: mechanism.to_string(),
                    initial: initial.map(str::to_string),
                }),
                _ => Err(Self::Syntax(command.to_owned())),
            }
        } else {
            match comm {
                "DATA" => Ok(Self::Data),
                "RSET" => Ok(Self::Rset),
                "QUIT" => Ok(Self::Quit),
                _ if comm == "NOOP" || comm.starts_with("NOOP ") => Ok(Self::Noop),
                _ => Err(Self::Invalid(command.to_owned())),
            }
        }
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}
