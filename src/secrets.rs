//! Credentials loaded from a TOML file.
//!
//! ```toml
//! arl = "..."              # 192 characters, session cookie
//! bf_secret = "..."        # 16 bytes, salt for per-track keys
//! access_token = "..."     # optional, enables unencrypted lossless URLs
//! ```
//!
//! None of these are compiled into the binary; the file should be readable
//! by the owner only.

use std::{fs, path::Path};

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use veil::Redact;

use crate::{
    arl::Arl,
    decrypt::Key,
    error::{Error, Result},
};

#[serde_as]
#[derive(Clone, Deserialize, Redact)]
#[serde(deny_unknown_fields)]
pub struct Secrets {
    #[serde_as(as = "DisplayFromStr")]
    #[redact]
    pub arl: Arl,

    #[serde_as(as = "DisplayFromStr")]
    #[redact]
    pub bf_secret: Key,

    #[serde(default)]
    #[redact]
    pub access_token: Option<String>,
}

impl Secrets {
    /// Files larger than this are rejected before reading.
    const MAX_FILE_SIZE: u64 = 4 * 1024;

    /// Reads and validates a secrets file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is larger than 4 KiB,
    /// or does not hold a valid `arl` and `bf_secret`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }
}

impl std::str::FromStr for Secrets {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let secrets: Self = toml::from_str(s)?;
        if secrets
            .access_token
            .as_ref()
            .is_some_and(|token| token.trim().is_empty())
        {
            return Err(Error::invalid_argument("access token is empty"));
        }

        Ok(secrets)
    }
}

#[cfg(test)]
mod tests {
    use std::{env, process};

    use super::*;
    use crate::error::ErrorKind;

    fn secrets_toml(arl: &str, secret: &str, access_token: Option<&str>) -> String {
        let mut toml = format!("arl = \"{arl}\"\nbf_secret = \"{secret}\"\n");
        if let Some(token) = access_token {
            toml.push_str(&format!("access_token = \"{token}\"\n"));
        }
        toml
    }

    #[test]
    fn parses_all_fields() {
        let arl = "c".repeat(Arl::LENGTH);
        let secrets: Secrets = secrets_toml(&arl, "0123456789abcdef", Some("token"))
            .parse()
            .unwrap();

        assert_eq!(secrets.arl.as_str(), arl);
        assert_eq!(*secrets.bf_secret, *b"0123456789abcdef");
        assert_eq!(secrets.access_token.as_deref(), Some("token"));
    }

    #[test]
    fn access_token_is_optional() {
        let secrets: Secrets = secrets_toml(&"c".repeat(Arl::LENGTH), "0123456789abcdef", None)
            .parse()
            .unwrap();
        assert!(secrets.access_token.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        let arl = "c".repeat(Arl::LENGTH);
        assert!(secrets_toml("short", "0123456789abcdef", None)
            .parse::<Secrets>()
            .is_err());
        assert!(secrets_toml(&arl, "too short", None).parse::<Secrets>().is_err());
        assert!(secrets_toml(&arl, "0123456789abcdef", Some(" "))
            .parse::<Secrets>()
            .is_err());
        assert!("bf_secret = \"0123456789abcdef\""
            .parse::<Secrets>()
            .is_err());
    }

    #[test]
    fn rejects_oversized_files() {
        let path = env::temp_dir().join(format!("dzstream-secrets-{}.toml", process::id()));
        let mut contents = secrets_toml(&"c".repeat(Arl::LENGTH), "0123456789abcdef", None);
        contents.push_str(&format!("# {}\n", "x".repeat(5000)));
        fs::write(&path, contents).unwrap();

        let result = Secrets::from_file(&path);
        fs::remove_file(&path).unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::OutOfRange);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = Secrets::from_file("/nonexistent/secrets.toml").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
