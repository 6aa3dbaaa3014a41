//! Session data of the ARL account.
//!
//! Only the parts needed for catalog lookups are kept:
//!
//! ```json
//! {
//!     "USER": {
//!         "USER_ID": "123456789",
//!         "BLOG_NAME": "Username"
//!     },
//!     "checkForm": "api_token"
//! }
//! ```
//!
//! An expired or missing ARL yields user ID `0`.

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use veil::Redact;

use super::Method;

impl Method for UserData {
    const METHOD: &'static str = "deezer.getUserData";
}

#[derive(Clone, Eq, PartialEq, Deserialize, Redact)]
pub struct UserData {
    #[serde(rename = "USER")]
    pub user: User,

    /// API token to send with every further gateway call.
    #[serde(rename = "checkForm")]
    #[redact]
    pub api_token: String,
}

#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Debug)]
pub struct User {
    #[serde(rename = "USER_ID")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: u64,

    #[serde(default, rename = "BLOG_NAME")]
    pub name: String,
}

impl User {
    /// Whether the session belongs to a logged-in account.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.id != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_numeric_ids() {
        let data: UserData = serde_json::from_str(
            r#"{"USER": {"USER_ID": "42", "BLOG_NAME": "listener"}, "checkForm": "token"}"#,
        )
        .unwrap();
        assert_eq!(data.user.id, 42);
        assert!(data.user.is_logged_in());
        assert_eq!(data.api_token, "token");

        let data: UserData =
            serde_json::from_str(r#"{"USER": {"USER_ID": 0}, "checkForm": "s3cr3t"}"#).unwrap();
        assert!(!data.user.is_logged_in());
        assert!(!format!("{data:?}").contains("s3cr3t"));
    }
}
