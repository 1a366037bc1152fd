use core::fmt::{self, Display};

use crate::auth::MECHANISMS;

/// Service extensions announced in the EHLO reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    EightBitMime,
    EnhancedStatusCodes,
    Auth,
    Size(usize),
}

impl Extension {
    /// Everything the proxy supports, in the order it is announced.
    pub const fn advertised(max_message_size: usize) -> [Self; 4] {
        [
            Self::EightBitMime,
            Self::EnhancedStatusCodes,
            Self::Auth,
            Self::Size(max_message_size),
        ]
    }
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::EnhancedStatusCodes => fmt.write_str("ENHANCEDSTATUSCODES"),
            Self::Auth => {
                fmt.write_str("AUTH")?;
                for mechanism in MECHANISMS {
                    write!(fmt, " {mechanism}")?;
                }
                Ok(())
            }
            Self::Size(max) => write!(fmt, "SIZE {max}"),
        }
    }
}
