//! Client connection configuration.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::PublicKey;
use russh::keys::ssh_key::{Algorithm, EcdsaCurve, HashAlg};
use secrecy::SecretString;

use crate::error::{ConfigError, HostKeyError};
use crate::halt::Halter;

/// Identification string sent when the config does not name one.
pub const PACKAGE_VERSION: &str = concat!("SSH-2.0-ferrissh-mux_", env!("CARGO_PKG_VERSION"));

/// Host key algorithms offered when the config leaves them empty, in order
/// of preference.
pub fn default_host_key_algorithms() -> Vec<Algorithm> {
    vec![
        Algorithm::Ed25519,
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        },
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP384,
        },
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP521,
        },
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha512),
        },
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha256),
        },
    ]
}

/// Called once per handshake with the hostname, the remote address and the
/// key the server offered. Returning an error aborts the handshake.
pub type HostKeyCallback =
    Arc<dyn Fn(&str, SocketAddr, &PublicKey) -> Result<(), HostKeyError> + Send + Sync>;

/// Settings shared with the SSH engine.
#[derive(Debug, Clone, Default)]
pub struct BaseConfig {
    /// Algorithm preferences. The engine defaults are used when unset.
    pub preferred: Option<russh::Preferred>,

    /// Drop the connection after this long without any traffic.
    pub inactivity_timeout: Option<Duration>,

    /// Interval between keepalive requests sent to the server.
    pub keepalive_interval: Option<Duration>,
}

/// Authentication method for SSH connections.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// The `none` method.
    None,

    /// Password authentication.
    Password(SecretString),

    /// Private key authentication.
    PrivateKey {
        /// Path to the private key file.
        path: PathBuf,
        /// Optional passphrase for encrypted keys.
        passphrase: Option<SecretString>,
    },
}

impl AuthMethod {
    /// RFC 4252 method name.
    pub fn method_name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey { .. } => "publickey",
        }
    }
}

/// Client connection configuration.
///
/// `host_key_callback` and `halt` are required; connecting without them
/// fails before any I/O.
#[derive(Clone)]
pub struct ClientConfig {
    /// Engine settings.
    pub base: BaseConfig,

    /// Username for authentication.
    pub user: String,

    /// Hostname reported to the host key callback. Defaults to the dial
    /// address.
    pub host_port: Option<String>,

    /// Authentication methods, tried in order. Only the first method of each
    /// kind is used.
    pub auth: Vec<AuthMethod>,

    /// Host key policy.
    pub host_key_callback: Option<HostKeyCallback>,

    /// Identification string. Defaults to [`PACKAGE_VERSION`].
    pub client_version: Option<String>,

    /// Accepted host key algorithms. Defaults to
    /// [`default_host_key_algorithms`].
    pub host_key_algorithms: Vec<Algorithm>,

    /// Dial timeout, zero for none.
    pub timeout: Duration,

    /// Idle timeout applied to channel readers.
    pub idle_timeout: Option<Duration>,

    /// Shutdown signal for everything owned by the connection.
    pub halt: Option<Halter>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            user: String::new(),
            host_port: None,
            auth: Vec::new(),
            host_key_callback: None,
            client_version: None,
            host_key_algorithms: Vec::new(),
            timeout: Duration::from_secs(30),
            idle_timeout: None,
            halt: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base", &self.base)
            .field("user", &self.user)
            .field("host_port", &self.host_port)
            .field("auth", &self.auth)
            .field("host_key_callback", &self.host_key_callback.is_some())
            .field("client_version", &self.client_version)
            .field("host_key_algorithms", &self.host_key_algorithms)
            .field("timeout", &self.timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("halt", &self.halt)
            .finish()
    }
}

impl ClientConfig {
    /// The identification string to send.
    pub fn client_version(&self) -> &str {
        self.client_version.as_deref().unwrap_or(PACKAGE_VERSION)
    }

    /// Check required fields and the version string.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_key_callback.is_none() {
            return Err(ConfigError::MissingHostKeyCallback);
        }
        if self.halt.is_none() {
            return Err(ConfigError::MissingHalter);
        }
        check_version(self.client_version())
    }

    /// Engine configuration derived from this config.
    pub(crate) fn engine_config(&self) -> client::Config {
        let mut preferred = self.base.preferred.clone().unwrap_or_default();
        preferred.key = Cow::Owned(if self.host_key_algorithms.is_empty() {
            default_host_key_algorithms()
        } else {
            self.host_key_algorithms.clone()
        });

        client::Config {
            client_id: russh::SshId::Standard(self.client_version().to_string()),
            preferred,
            inactivity_timeout: self.base.inactivity_timeout,
            keepalive_interval: self.base.keepalive_interval,
            ..Default::default()
        }
    }
}

fn check_version(version: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidClientVersion {
        version: version.to_string(),
        reason,
    };
    if !version.starts_with("SSH-2.0-") {
        return Err(invalid("must start with SSH-2.0-"));
    }
    if version.contains(['\r', '\n']) {
        return Err(invalid("must not contain line breaks"));
    }
    // RFC 4253 section 4.2, CR LF excluded
    if version.len() > 253 {
        return Err(invalid("longer than 253 bytes"));
    }
    Ok(())
}

/// Builder for [`ClientConfig`].
///
/// # Example
///
/// ```rust
/// use ferrissh_mux::transport::{ClientConfigBuilder, insecure_ignore_host_key};
///
/// let config = ClientConfigBuilder::new("admin")
///     .password("secret")
///     .host_key_callback(insecure_ignore_host_key())
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Start a config for `user` with a fresh halter.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                user: user.into(),
                halt: Some(Halter::new()),
                ..Default::default()
            },
        }
    }

    /// Add password authentication.
    pub fn password(self, password: impl Into<String>) -> Self {
        self.auth(AuthMethod::Password(SecretString::from(password.into())))
    }

    /// Add private key authentication.
    pub fn private_key(self, key_path: impl Into<PathBuf>) -> Self {
        self.auth(AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: None,
        })
    }

    /// Add private key authentication with passphrase.
    pub fn private_key_with_passphrase(
        self,
        key_path: impl Into<PathBuf>,
        passphrase: impl Into<String>,
    ) -> Self {
        self.auth(AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: Some(SecretString::from(passphrase.into())),
        })
    }

    /// Append an authentication method.
    pub fn auth(mut self, method: AuthMethod) -> Self {
        self.config.auth.push(method);
        self
    }

    pub fn host_key_callback(mut self, callback: HostKeyCallback) -> Self {
        self.config.host_key_callback = Some(callback);
        self
    }

    /// Override the hostname passed to the host key callback.
    pub fn host_port(mut self, host_port: impl Into<String>) -> Self {
        self.config.host_port = Some(host_port.into());
        self
    }

    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.config.client_version = Some(version.into());
        self
    }

    pub fn host_key_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.config.host_key_algorithms = algorithms;
        self
    }

    pub fn preferred(mut self, preferred: russh::Preferred) -> Self {
        self.config.base.preferred = Some(preferred);
        self
    }

    /// Set the dial timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the idle timeout for channel readers.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.base.inactivity_timeout = Some(timeout);
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.base.keepalive_interval = Some(interval);
        self
    }

    /// Share an existing halter with the connection.
    pub fn halt(mut self, halt: Halter) -> Self {
        self.config.halt = Some(halt);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
