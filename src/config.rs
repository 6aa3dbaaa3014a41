use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use veil::Redact;

use crate::arl::Arl;

#[derive(Clone, Eq, PartialEq, Redact)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub app_lang: String,

    pub user_agent: String,

    /// Address the HTTP server binds to.
    pub listen: SocketAddr,

    /// Upper bound on each quality probe.
    pub probe_timeout: Duration,

    /// Session cookie for the web gateway. Without it only anonymous
    /// catalog lookups work.
    #[redact]
    pub arl: Option<Arl>,

    /// OAuth token enabling unencrypted lossless URLs.
    #[redact]
    pub access_token: Option<String>,
}

impl Config {
    pub const DEFAULT_LISTEN_PORT: u16 = 10069;

    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a configuration with defaults and a desktop-like
    /// `User-Agent`.
    ///
    /// # Panics
    ///
    /// Panics if the package metadata or the detected operating system
    /// cannot be put into a `User-Agent` string.
    #[must_use]
    pub fn new() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let app_lang = "en".to_owned();

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
            || app_lang.chars().count() != 2
            || app_lang.contains(illegal_chars)
        {
            panic!(
                "application name, version and/or language invalid (\"{app_name}\"; \"{app_version}\"; \"{app_lang}\")"
            );
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version()
            .filter(|version| !version.is_empty() && !version.contains(illegal_chars))
            .unwrap_or_else(|| String::from("0"));

        let user_agent =
            format!("{app_name}/{app_version} (Rust; {os_name}/{os_version}; Desktop; {app_lang})");
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,
            app_lang,

            user_agent,

            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, Self::DEFAULT_LISTEN_PORT)),
            probe_timeout: Self::DEFAULT_PROBE_TIMEOUT,

            arl: None,
            access_token: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.listen.to_string(), "127.0.0.1:10069");
        assert_eq!(config.probe_timeout, Duration::from_secs(10));
        assert!(config.arl.is_none());
        assert!(config
            .user_agent
            .starts_with(&format!("dzstream/{} (Rust; ", env!("CARGO_PKG_VERSION"))));
        assert!(config.user_agent.ends_with("; Desktop; en)"));
    }
}
