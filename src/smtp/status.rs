use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady,
    GoodBye,
    AuthSuccessful,
    Ok,
    AuthChallenge,
    StartMailInput,
    Unavailable,
    ActionUnavailable,
    InsufficientStorage,
    Syntax,
    ArgumentSyntax,
    NotImplemented,
    InvalidCommandSequence,
    ParameterNotImplemented,
    AuthRequired,
    AuthFailed,
    ExceededStorage,
    Unknown(u32),
}

impl Status {
    /// Checks if the status is a permanent rejection
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSuccessful,
            250 => Self::Ok,
            334 => Self::AuthChallenge,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            451 => Self::ActionUnavailable,
            452 => Self::InsufficientStorage,
            500 => Self::Syntax,
            501 => Self::ArgumentSyntax,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            504 => Self::ParameterNotImplemented,
            530 => Self::AuthRequired,
            535 => Self::AuthFailed,
            552 => Self::ExceededStorage,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSuccessful => 235,
            Status::Ok => 250,
            Status::AuthChallenge => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::ActionUnavailable => 451,
            Status::InsufficientStorage => 452,
            Status::Syntax => 500,
            Status::ArgumentSyntax => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::ParameterNotImplemented => 504,
            Status::AuthRequired => 530,
            Status::AuthFailed => 535,
            Status::ExceededStorage => 552,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}

/// RFC 3463 enhanced status code, `class.subject.detail`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EnhancedCode(pub u8, pub u16, pub u16);

impl Display for EnhancedCode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// A single line reply sent to the client.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Reply {
    pub status: Status,
    pub enhanced: Option<EnhancedCode>,
    pub message: Cow<'static, str>,
}

impl Reply {
    #[must_use]
    pub const fn new(status: Status, enhanced: EnhancedCode, message: &'static str) -> Self {
        Self {
            status,
            enhanced: Some(enhanced),
            message: Cow::Borrowed(message),
        }
    }

    #[must_use]
    pub fn plain(status: Status, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            enhanced: None,
            message: message.into(),
        }
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self.enhanced {
            Some(enhanced) => write!(fmt, "{} {enhanced} {}", self.status, self.message),
            None => write!(fmt, "{} {}", self.status, self.message),
        }
    }
}
