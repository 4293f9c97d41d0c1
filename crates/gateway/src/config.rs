//! Configuration loading and validation for the gateway.
//!
//! All values are read from environment variables once at startup and passed
//! by value into each component's constructor. Nothing reads the environment
//! after this point. The process exits with a clear error message if any
//! required variable is missing or invalid.

use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result};
use hyper::Uri;
use serde::Deserialize;

/// Validated gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The single domain certificates are provisioned for. **Required.**
    pub domain: String,

    /// Host/IP both listeners bind to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port of the TLS listener.
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Port of the plaintext HTTP → HTTPS redirector.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Base URL of the backend data API that proxied requests are sent to.
    #[serde(default = "default_backend_base_url")]
    pub backend_base_url: String,

    /// Path prefix that is stripped and reverse-proxied to the backend.
    #[serde(default = "default_backend_proxy_prefix")]
    pub backend_proxy_prefix: String,

    /// Basic-Auth username. Gating is active only when the password is also set.
    #[serde(default)]
    pub basic_auth_username: Option<String>,

    /// Basic-Auth password. Gating is active only when the username is also set.
    #[serde(default)]
    pub basic_auth_password: Option<String>,

    /// Directory holding the built single-page application.
    #[serde(default = "default_asset_dir")]
    pub asset_dir: String,

    /// Path prefixes served with the SPA index document.
    #[serde(default = "default_spa_prefixes")]
    pub spa_prefixes: Vec<String>,

    /// Request header carrying the caller's public identity on login.
    #[serde(default = "default_identity_header")]
    pub identity_header: String,

    /// Append-only file backing the identity store. In-memory when unset.
    #[serde(default)]
    pub identity_store_path: Option<String>,

    /// Certificate cache directory. Defaults to `./<domain>`.
    #[serde(default)]
    pub cert_cache_dir: Option<String>,

    /// ACME directory URL of the certificate authority.
    #[serde(default = "default_acme_directory_url")]
    pub acme_directory_url: String,

    /// Optional contact address registered with the ACME account.
    #[serde(default)]
    pub acme_contact_email: Option<String>,

    /// Renew certificates this many days before they expire.
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    /// PEM certificate chain for static certificate mode (no ACME).
    #[serde(default)]
    pub tls_cert_path: Option<String>,

    /// PEM private key for static certificate mode (no ACME).
    #[serde(default)]
    pub tls_key_path: Option<String>,

    /// Main listener: time allowed for the TLS handshake and for each set of
    /// request headers, including the wait between keep-alive requests.
    #[serde(default = "default_long_timeout")]
    pub read_timeout_secs: u64,

    /// Main listener: time allowed to produce a response.
    #[serde(default = "default_long_timeout")]
    pub write_timeout_secs: u64,

    /// Read/write timeout of the redirector.
    #[serde(default = "default_redirect_timeout")]
    pub redirect_timeout_secs: u64,

    /// Initial warrant canary state.
    #[serde(default)]
    pub warrant_received: bool,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional OTLP endpoint for span export.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,
}

fn default_bind_host() -> String {
    "0.0.0.0".into()
}
fn default_https_port() -> u16 {
    443
}
fn default_http_port() -> u16 {
    80
}
fn default_backend_base_url() -> String {
    "http://localhost:3000/".into()
}
fn default_backend_proxy_prefix() -> String {
    "/postgrest".into()
}
fn default_asset_dir() -> String {
    "./build".into()
}
fn default_spa_prefixes() -> Vec<String> {
    (0..10)
        .map(|i| format!("/{i}"))
        .chain(["/dashboard".to_owned(), "/pursuance".to_owned()])
        .collect()
}
fn default_identity_header() -> String {
    common::protocol::DEFAULT_IDENTITY_HEADER.into()
}
fn default_acme_directory_url() -> String {
    instant_acme::LetsEncrypt::Production.url().into()
}
fn default_renew_before_days() -> u64 {
    30
}
fn default_long_timeout() -> u64 {
    1000
}
fn default_redirect_timeout() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}

/// Basic-Auth credential pair, present only when both halves are configured.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(config::Environment::default())
    }

    /// Values stay strings until serde asks for a typed field, so a password
    /// like `007` is kept verbatim.
    fn from_environment(env: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(
                env.list_separator(",")
                    .with_list_parse_key("spa_prefixes"),
            )
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.domain, "DOMAIN")?;
        ensure_non_empty(&self.identity_header, "IDENTITY_HEADER")?;
        ensure_non_empty(&self.asset_dir, "ASSET_DIR")?;
        hyper::header::HeaderName::from_bytes(self.identity_header.as_bytes())
            .with_context(|| format!("IDENTITY_HEADER {:?} is not a header name", self.identity_header))?;

        if !self.backend_proxy_prefix.starts_with('/') || self.backend_proxy_prefix == "/" {
            anyhow::bail!("BACKEND_PROXY_PREFIX must start with '/' and name a path segment");
        }
        if let Some(bad) = self.spa_prefixes.iter().find(|p| !p.starts_with('/')) {
            anyhow::bail!("SPA_PREFIXES entry {bad:?} must start with '/'");
        }
        self.backend_uri()?;
        self.listen_addr(self.https_port)?;

        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            anyhow::bail!("TLS_CERT_PATH and TLS_KEY_PATH must be set together");
        }
        if self.read_timeout_secs == 0 || self.write_timeout_secs == 0 {
            anyhow::bail!("READ_TIMEOUT_SECS and WRITE_TIMEOUT_SECS must be > 0");
        }
        if self.redirect_timeout_secs == 0 {
            anyhow::bail!("REDIRECT_TIMEOUT_SECS must be > 0");
        }
        if self.renew_before_days == 0 {
            anyhow::bail!("RENEW_BEFORE_DAYS must be > 0");
        }
        Ok(())
    }

    /// Parsed backend base URL.
    ///
    /// # Errors
    ///
    /// Returns an error unless the URL is absolute `http` or `https`.
    pub fn backend_uri(&self) -> Result<Uri> {
        let uri: Uri = self
            .backend_base_url
            .parse()
            .with_context(|| format!("BACKEND_BASE_URL {:?} is not a URL", self.backend_base_url))?;
        match (uri.scheme_str(), uri.authority()) {
            (Some("http" | "https"), Some(_)) => Ok(uri),
            _ => anyhow::bail!("BACKEND_BASE_URL must be an absolute http(s) URL"),
        }
    }

    /// Socket address for a listener on `port`.
    ///
    /// # Errors
    ///
    /// Returns an error if `BIND_HOST` is not an IP address.
    pub fn listen_addr(&self, port: u16) -> Result<SocketAddr> {
        let ip: std::net::IpAddr = self
            .bind_host
            .parse()
            .with_context(|| format!("BIND_HOST {:?} is not an IP address", self.bind_host))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Basic-Auth credentials if and only if both username and password are set.
    pub fn basic_credentials(&self) -> Option<BasicCredentials> {
        match (&self.basic_auth_username, &self.basic_auth_password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(BasicCredentials {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => None,
        }
    }

    /// Directory the certificate cache lives in.
    pub fn cert_cache_dir(&self) -> PathBuf {
        match &self.cert_cache_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(".").join(&self.domain),
        }
    }

    /// Location of the SPA index document.
    pub fn index_path(&self) -> PathBuf {
        PathBuf::from(&self.asset_dir).join("index.html")
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_secs(self.redirect_timeout_secs)
    }

    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_days * 24 * 60 * 60)
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample() -> Config {
        Config {
            domain: "example.org".into(),
            bind_host: default_bind_host(),
            https_port: default_https_port(),
            http_port: default_http_port(),
            backend_base_url: default_backend_base_url(),
            backend_proxy_prefix: default_backend_proxy_prefix(),
            basic_auth_username: None,
            basic_auth_password: None,
            asset_dir: default_asset_dir(),
            spa_prefixes: default_spa_prefixes(),
            identity_header: default_identity_header(),
            identity_store_path: None,
            cert_cache_dir: None,
            acme_directory_url: default_acme_directory_url(),
            acme_contact_email: None,
            renew_before_days: default_renew_before_days(),
            tls_cert_path: None,
            tls_key_path: None,
            read_timeout_secs: default_long_timeout(),
            write_timeout_secs: default_long_timeout(),
            redirect_timeout_secs: default_redirect_timeout(),
            warrant_received: false,
            log_level: default_log_level(),
            otel_exporter_otlp_endpoint: None,
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_https_port(), 443);
        assert_eq!(default_http_port(), 80);
        assert_eq!(default_backend_base_url(), "http://localhost:3000/");
        assert_eq!(default_backend_proxy_prefix(), "/postgrest");
        assert_eq!(default_long_timeout(), 1000);
        assert_eq!(default_redirect_timeout(), 5);
        assert_eq!(default_identity_header(), "X-Public-Identity");
        assert!(default_acme_directory_url().starts_with("https://"));
    }

    #[test]
    fn default_spa_prefixes_cover_digits_and_sections() {
        let prefixes = default_spa_prefixes();
        for i in 0..10 {
            assert!(prefixes.contains(&format!("/{i}")));
        }
        assert!(prefixes.contains(&"/dashboard".to_owned()));
        assert!(prefixes.contains(&"/pursuance".to_owned()));
        assert_eq!(prefixes.len(), 12);
    }

    #[test]
    fn sample_validates() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_domain() {
        let cfg = Config {
            domain: " ".into(),
            ..sample()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unparsable_backend() {
        let cfg = Config {
            backend_base_url: "not a url".into(),
            ..sample()
        };
        assert!(cfg.validate().is_err());

        let relative = Config {
            backend_base_url: "/just/a/path".into(),
            ..sample()
        };
        assert!(relative.validate().is_err());
    }

    #[test]
    fn validate_rejects_root_proxy_prefix() {
        let cfg = Config {
            backend_proxy_prefix: "/".into(),
            ..sample()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_identity_header() {
        let cfg = Config {
            identity_header: "X Public Identity".into(),
            ..sample()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_half_static_tls() {
        let cfg = Config {
            tls_cert_path: Some("/etc/tls/cert.pem".into()),
            ..sample()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn basic_credentials_need_both_halves() {
        let only_user = Config {
            basic_auth_username: Some("admin".into()),
            ..sample()
        };
        assert!(only_user.basic_credentials().is_none());

        let both = Config {
            basic_auth_username: Some("admin".into()),
            basic_auth_password: Some("hunter2".into()),
            ..sample()
        };
        let creds = both.basic_credentials().unwrap();
        assert_eq!(creds.username, "admin");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    fn environment(vars: &[(&str, &str)]) -> config::Environment {
        let vars = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        config::Environment::default().source(Some(vars))
    }

    #[test]
    fn numeric_looking_credentials_load_verbatim() {
        let cfg = Config::from_environment(environment(&[
            ("DOMAIN", "example.org"),
            ("BASIC_AUTH_USERNAME", "0123"),
            ("BASIC_AUTH_PASSWORD", "007"),
            ("ACME_CONTACT_EMAIL", "1e3"),
        ]))
        .unwrap();

        let credentials = cfg.basic_credentials().unwrap();
        assert_eq!(credentials.username, "0123");
        assert_eq!(credentials.password, "007");
        assert_eq!(cfg.acme_contact_email.as_deref(), Some("1e3"));
    }

    #[test]
    fn typed_fields_and_lists_still_parse_from_strings() {
        let cfg = Config::from_environment(environment(&[
            ("DOMAIN", "example.org"),
            ("HTTPS_PORT", "8443"),
            ("RENEW_BEFORE_DAYS", "10"),
            ("WARRANT_RECEIVED", "true"),
            ("SPA_PREFIXES", "/app,/admin"),
        ]))
        .unwrap();

        assert_eq!(cfg.https_port, 8443);
        assert_eq!(cfg.renew_before_days, 10);
        assert!(cfg.warrant_received);
        assert_eq!(cfg.spa_prefixes, vec!["/app", "/admin"]);
    }

    #[test]
    fn cert_cache_dir_defaults_to_domain() {
        assert_eq!(sample().cert_cache_dir(), PathBuf::from("./example.org"));
    }
}
