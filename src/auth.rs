//! SASL style challenge/response exchanges used to authenticate local
//! clients.
//!
//! Every exchange validates through [`Credentials::verify`], which compares
//! both fields in constant time and never reports which of the two was wrong.

use core::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Plain,
    Login,
}

/// Advertised in this order.
pub const MECHANISMS: [Mechanism; 2] = [Mechanism::Plain, Mechanism::Login];

impl Mechanism {
    /// Start a fresh exchange validating against `credentials`.
    #[must_use]
    pub fn exchange(self, credentials: &Credentials) -> Box<dyn ChallengeResponse> {
        match self {
            Self::Plain => Box::new(PlainExchange::new(credentials.clone())),
            Self::Login => Box::new(LoginExchange::new(credentials.clone())),
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        })
    }
}

impl FromStr for Mechanism {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("PLAIN") {
            Ok(Self::Plain)
        } else if value.eq_ignore_ascii_case("LOGIN") {
            Ok(Self::Login)
        } else {
            Err(AuthError::UnknownMechanism(value.to_string()))
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication failed")]
    Failed,

    #[error("Unexpected client response")]
    UnexpectedResponse,

    #[error("Malformed client response")]
    Malformed,

    #[error("Unsupported authentication mechanism: {0}")]
    UnknownMechanism(String),
}

/// A username/password pair.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Both comparisons always run, so timing does not reveal which field
    /// mismatched.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let username = self.username.as_bytes().ct_eq(username.as_bytes());
        let password = self.password.as_bytes().ct_eq(password.as_bytes());

        (username & password).into()
    }
}

impl Debug for Credentials {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this challenge and feed the client's answer back in.
    Challenge(Vec<u8>),
    /// The client authenticated.
    Done,
}

/// One authentication attempt.
///
/// Instances are single use: create one per `AUTH` command and drop it when
/// the exchange finishes.
pub trait ChallengeResponse: Send {
    fn mechanism(&self) -> Mechanism;

    /// Advance the exchange with the client's latest (decoded) response.
    ///
    /// `None` means the client has not sent anything yet, i.e. `AUTH` came
    /// without an initial response.
    ///
    /// # Errors
    ///
    /// [`AuthError::Failed`] when the credentials do not match, otherwise a
    /// protocol error for a response that does not fit the exchange.
    fn next(&mut self, response: Option<&[u8]>) -> Result<Step, AuthError>;
}

/// RFC 4616: `[authzid] NUL authcid NUL passwd` in a single response.
#[derive(Debug)]
pub struct PlainExchange {
    credentials: Credentials,
    done: bool,
}

impl PlainExchange {
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            done: false,
        }
    }
}

impl ChallengeResponse for PlainExchange {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Plain
    }

    fn next(&mut self, response: Option<&[u8]>) -> Result<Step, AuthError> {
        if self.done {
            return Err(AuthError::UnexpectedResponse);
        }

        let Some(response) = response else {
            return Ok(Step::Challenge(Vec::new()));
        };

        self.done = true;

        let parts = response.split(|byte| *byte == 0).collect::<Vec<_>>();
        let [_identity, username, password] = parts.as_slice() else {
            return Err(AuthError::Malformed);
        };

        let username = std::str::from_utf8(username).map_err(|_| AuthError::Malformed)?;
        let password = std::str::from_utf8(password).map_err(|_| AuthError::Malformed)?;

        if self.credentials.verify(username, password) {
            Ok(Step::Done)
        } else {
            Err(AuthError::Failed)
        }
    }
}

/// The legacy `LOGIN` mechanism: prompt for the username, then the password.
pub struct LoginExchange {
    credentials: Credentials,
    step: u8,
    username: String,
}

impl LoginExchange {
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            step: 0,
            username: String::new(),
        }
    }
}

impl ChallengeResponse for LoginExchange {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Login
    }

    fn next(&mut self, response: Option<&[u8]>) -> Result<Step, AuthError> {
        let step = self.step;
        self.step = self.step.saturating_add(1);

        match step {
            // Any initial response is ignored; the username is always prompted for.
            0 => Ok(Step::Challenge(b"Username:".to_vec())),
            1 => {
                self.username = String::from_utf8_lossy(response.unwrap_or_default()).into_owned();
                Ok(Step::Challenge(b"Password:".to_vec()))
            }
            2 => {
                let password = String::from_utf8_lossy(response.unwrap_or_default());
                if self.credentials.verify(&self.username, &password) {
                    Ok(Step::Done)
                } else {
                    Err(AuthError::Failed)
                }
            }
            _ => Err(AuthError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials::new("testuser", "testpass")
    }

    #[test]
    fn test_verify() {
        let credentials = credentials();

        assert!(credentials.verify("testuser", "testpass"));
        assert!(!credentials.verify("testuser", "wrong"));
        assert!(!credentials.verify("wrong", "testpass"));
        assert!(!credentials.verify("", ""));
        assert!(!credentials.verify("testuser", "testpas"));
    }

    #[test]
    fn test_mechanism_parse() {
        assert_eq!("plain".parse::<Mechanism>(), Ok(Mechanism::Plain));
        assert_eq!("LOGIN".parse::<Mechanism>(), Ok(Mechanism::Login));
        assert_eq!(
            "CRAM-MD5".parse::<Mechanism>(),
            Err(AuthError::UnknownMechanism("CRAM-MD5".to_string()))
        );
        assert_eq!(
            MECHANISMS.map(|mechanism| mechanism.to_string()),
            ["PLAIN", "LOGIN"]
        );
    }

    #[test]
    fn test_plain_initial_response() {
        let mut exchange = PlainExchange::new(credentials());

        assert_eq!(exchange.next(Some(b"\0testuser\0testpass")), Ok(Step::Done));
        assert_eq!(
            exchange.next(Some(b"\0testuser\0testpass")),
            Err(AuthError::UnexpectedResponse)
        );
    }

    #[test]
    fn test_plain_with_challenge() {
        let mut exchange = PlainExchange::new(credentials());

        assert_eq!(exchange.next(None), Ok(Step::Challenge(Vec::new())));
        assert_eq!(
            exchange.next(Some(b"identity\0testuser\0testpass")),
            Ok(Step::Done)
        );
    }

    #[test]
    fn test_plain_rejects_wrong_password() {
        let mut exchange = PlainExchange::new(credentials());
        assert_eq!(
            exchange.next(Some(b"\0testuser\0nope")),
            Err(AuthError::Failed)
        );
    }

    #[test]
    fn test_plain_malformed() {
        let mut exchange = PlainExchange::new(credentials());
        assert_eq!(exchange.next(Some(b"testuser")), Err(AuthError::Malformed));

        let mut exchange = PlainExchange::new(credentials());
        assert_eq!(exchange.next(Some(b"")), Err(AuthError::Malformed));
    }

    #[test]
    fn test_login_steps() {
        let mut exchange = LoginExchange::new(credentials());

        assert_eq!(
            exchange.next(None),
            Ok(Step::Challenge(b"Username:".to_vec()))
        );
        assert_eq!(
            exchange.next(Some(b"testuser")),
            Ok(Step::Challenge(b"Password:".to_vec()))
        );
        assert_eq!(exchange.next(Some(b"testpass")), Ok(Step::Done));
        assert_eq!(
            exchange.next(Some(b"extra")),
            Err(AuthError::UnexpectedResponse)
        );
    }

    #[test]
    fn test_login_failure_is_uniform() {
        for (username, password) in [("testuser", "wrong"), ("wrong", "testpass")] {
            let mut exchange = LoginExchange::new(credentials());
            exchange.next(None).unwrap();
            exchange.next(Some(username.as_bytes())).unwrap();
            assert_eq!(
                exchange.next(Some(password.as_bytes())),
                Err(AuthError::Failed)
            );
        }
    }

    #[test]
    fn test_login_ignores_initial_response() {
        let mut exchange = LoginExchange::new(credentials());
        assert_eq!(
            exchange.next(Some(b"testuser")),
            Ok(Step::Challenge(b"Username:".to_vec()))
        );
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let debug = format!("{:?}", credentials());
        assert!(debug.contains("testuser"));
        assert!(!debug.contains("testpass"));
    }
}
