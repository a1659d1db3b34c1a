//! Turning secret contents into a client connection.
//!
//! [`parse_secret`] interprets the credential fields of a [`Secret`] into
//! [`ConnectionSettings`]; [`build_connection`] then hands those settings to a
//! [`Connector`], the library that actually constructs the client.
//!
//! # Secret format
//!
//! | Field             | Required | Meaning                                         |
//! |-------------------|----------|-------------------------------------------------|
//! | `ovirt_url`       | yes      | Engine API endpoint                             |
//! | `ovirt_username`  | yes      | Principal                                       |
//! | `ovirt_password`  | yes      | Secret                                          |
//! | `ovirt_insecure`  | no       | `"true"` disables TLS verification              |
//! | `ovirt_ca_bundle` | no       | PEM trust bundle, required unless insecure      |

use crate::secret::Secret;
use crate::BoxError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use url::Url;
use zeroize::Zeroizing;

/// Secret field holding the endpoint URL.
pub const URL_FIELD: &str = "ovirt_url";
/// Secret field holding the username.
pub const USERNAME_FIELD: &str = "ovirt_username";
/// Secret field holding the password.
pub const PASSWORD_FIELD: &str = "ovirt_password";
/// Secret field holding the insecure flag.
pub const INSECURE_FIELD: &str = "ovirt_insecure";
/// Secret field holding the CA bundle.
pub const CA_BUNDLE_FIELD: &str = "ovirt_ca_bundle";

/// Errors produced while turning a secret into a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A required field is absent or empty.
    #[error("missing required field {field}")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A text field does not hold valid UTF-8.
    #[error("field {field} is not valid UTF-8")]
    NotUtf8 {
        /// Name of the offending field.
        field: &'static str,
    },

    /// Neither the insecure flag nor a CA bundle is set.
    #[error("either ovirt_insecure must be \"true\" or ovirt_ca_bundle must be set")]
    MissingTrustPolicy,

    /// The endpoint URL cannot be parsed.
    ///
    /// Checked before the [`Connector`] is called, so a malformed URL is
    /// reported here rather than as [`ParseError::BuildFailed`].
    #[error("invalid ovirt_url: {source}")]
    InvalidUrl {
        /// The underlying parse failure.
        #[source]
        source: url::ParseError,
    },

    /// The connector failed to build a connection.
    #[error("failed to build connection: {0}")]
    BuildFailed(#[source] BoxError),
}

/// How the connection verifies the server certificate.
#[derive(Clone, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Certificate verification is disabled.
    Insecure,
    /// Certificates are verified against this PEM bundle.
    CaBundle(Vec<u8>),
}

impl fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insecure => f.write_str("Insecure"),
            Self::CaBundle(pem) => write!(f, "CaBundle(<{} bytes>)", pem.len()),
        }
    }
}

/// Parameters for building a connection, as read from the secret.
#[derive(Clone)]
pub struct ConnectionSettings {
    url: Url,
    username: String,
    password: Zeroizing<String>,
    tls: TlsPolicy,
}

impl ConnectionSettings {
    /// Creates settings from already parsed values.
    pub fn new(
        url: Url,
        username: impl Into<String>,
        password: impl Into<String>,
        tls: TlsPolicy,
    ) -> Self {
        Self {
            url,
            username: username.into(),
            password: Zeroizing::new(password.into()),
            tls,
        }
    }

    /// Endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password. The backing buffer is zeroed when the settings are dropped.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// TLS verification policy.
    pub fn tls(&self) -> &TlsPolicy {
        &self.tls
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .finish()
    }
}

/// A client connection built from the credentials.
///
/// Handles are shared as `Arc<dyn Connection>`. A handle that has been
/// superseded stays usable by whoever still holds it.
pub trait Connection: fmt::Debug + Send + Sync + 'static {
    /// Endpoint the connection talks to.
    fn url(&self) -> &Url;

    /// Principal the connection authenticates as.
    fn username(&self) -> &str;

    /// Performs a lightweight connectivity and authentication probe.
    ///
    /// Must not change the state of the connection.
    ///
    /// # Errors
    ///
    /// Returns the reason the probe failed.
    fn test(&self) -> Result<(), BoxError>;
}

/// Builds connections from [`ConnectionSettings`].
///
/// Implemented for closures of the matching signature.
pub trait Connector: Send + Sync + 'static {
    /// Builds a connection.
    ///
    /// # Errors
    ///
    /// Returns the reason the settings could not be turned into a connection.
    fn build(&self, settings: ConnectionSettings) -> Result<Arc<dyn Connection>, BoxError>;
}

impl<F> Connector for F
where
    F: Fn(ConnectionSettings) -> Result<Arc<dyn Connection>, BoxError> + Send + Sync + 'static,
{
    fn build(&self, settings: ConnectionSettings) -> Result<Arc<dyn Connection>, BoxError> {
        self(settings)
    }
}

fn required_text(secret: &Secret, field: &'static str) -> Result<String, ParseError> {
    let raw = match secret.get(field) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(ParseError::MissingField { field }),
    };
    String::from_utf8(raw.to_vec()).map_err(|_| ParseError::NotUtf8 { field })
}

fn tls_policy(secret: &Secret) -> Result<TlsPolicy, ParseError> {
    // Any value other than exactly "true" falls through to the CA bundle.
    if secret.get(INSECURE_FIELD) == Some(b"true".as_slice()) {
        return Ok(TlsPolicy::Insecure);
    }
    match secret.get(CA_BUNDLE_FIELD) {
        Some(pem) if !pem.is_empty() => Ok(TlsPolicy::CaBundle(pem.to_vec())),
        _ => Err(ParseError::MissingTrustPolicy),
    }
}

/// Reads the connection settings out of `secret`.
///
/// # Errors
///
/// Returns [`ParseError::MissingField`] for an absent or empty required field,
/// [`ParseError::NotUtf8`] for a text field with invalid encoding,
/// [`ParseError::MissingTrustPolicy`] when neither trust option is usable, and
/// [`ParseError::InvalidUrl`] for an unparseable endpoint.
pub fn parse_secret(secret: &Secret) -> Result<ConnectionSettings, ParseError> {
    let url = required_text(secret, URL_FIELD)?;
    let username = required_text(secret, USERNAME_FIELD)?;
    let password = Zeroizing::new(required_text(secret, PASSWORD_FIELD)?);
    let tls = tls_policy(secret)?;
    let url = Url::parse(&url).map_err(|source| ParseError::InvalidUrl { source })?;

    Ok(ConnectionSettings {
        url,
        username,
        password,
        tls,
    })
}

/// Parses `secret` and builds a connection with `connector`.
///
/// # Errors
///
/// Returns any error of [`parse_secret`], or [`ParseError::BuildFailed`] if
/// the connector rejects the settings.
pub fn build_connection(
    secret: &Secret,
    connector: &dyn Connector,
) -> Result<Arc<dyn Connection>, ParseError> {
    let settings = parse_secret(secret)?;
    connector.build(settings).map_err(ParseError::BuildFailed)
}
