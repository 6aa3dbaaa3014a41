//! Session cookie of a logged-in account.

use std::{fmt, ops::Deref, str::FromStr};

use veil::Redact;

use crate::error::{Error, Result};

/// Validated ARL cookie value. Redacted in debug output.
#[derive(Clone, Eq, PartialEq, Hash, Redact)]
#[redact(all)]
pub struct Arl(String);

impl Arl {
    /// Number of characters in a valid ARL.
    pub const LENGTH: usize = 192;
}

impl FromStr for Arl {
    type Err = Error;

    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `s` is not 192 characters of
    /// printable ASCII without cookie delimiters.
    fn from_str(s: &str) -> Result<Self> {
        let chars = s.chars().count();
        if chars != Self::LENGTH {
            return Err(Error::invalid_argument(format!(
                "arl should be {} characters long but is {chars}",
                Self::LENGTH
            )));
        }

        // The value ends up verbatim in a `Cookie` header.
        if let Some(chr) = s
            .chars()
            .find(|chr| !chr.is_ascii_graphic() || *chr == ';' || *chr == ',')
        {
            return Err(Error::invalid_argument(format!(
                "arl contains illegal character {chr:?}"
            )));
        }

        Ok(Self(s.to_owned()))
    }
}

impl Deref for Arl {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Arl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
