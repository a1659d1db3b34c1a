//! Secret identity and contents as seen by the monitor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Environment variable holding the name of the watched secret.
pub const SECRET_NAME_ENV: &str = "CREDENTIALS_SECRET_NAME";

/// Environment variable holding the namespace of the watched secret.
pub const SECRET_NAMESPACE_ENV: &str = "CREDENTIALS_SECRET_NAMESPACE";

/// Errors produced when a [`SecretRef`] is incomplete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SecretRefError {
    /// The secret name is empty.
    #[error("the secret name is required")]
    EmptyName,

    /// The secret namespace is empty.
    #[error("the secret namespace is required")]
    EmptyNamespace,

    /// A required environment variable is not set.
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
}

/// Identifies the secret holding the credentials.
///
/// Both fields are required; [`SecretRef::validate`] rejects empty values.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    name: String,
    namespace: String,
}

impl SecretRef {
    /// Creates a reference to the secret `name` in `namespace`.
    ///
    /// No validation is performed here; the monitor validates the reference
    /// when it is built.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Reads the reference from `CREDENTIALS_SECRET_NAMESPACE` and
    /// `CREDENTIALS_SECRET_NAME`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretRefError::MissingEnv`] if either variable is unset, or
    /// the error of [`SecretRef::validate`] if either is empty.
    pub fn from_env() -> Result<Self, SecretRefError> {
        let namespace = std::env::var(SECRET_NAMESPACE_ENV)
            .map_err(|_| SecretRefError::MissingEnv(SECRET_NAMESPACE_ENV))?;
        let name =
            std::env::var(SECRET_NAME_ENV).map_err(|_| SecretRefError::MissingEnv(SECRET_NAME_ENV))?;

        let secret = Self::new(namespace, name);
        secret.validate()?;
        Ok(secret)
    }

    /// Name of the secret.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the secret.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Checks that both the name and the namespace are set.
    ///
    /// # Errors
    ///
    /// Returns [`SecretRefError::EmptyName`] or [`SecretRefError::EmptyNamespace`].
    pub fn validate(&self) -> Result<(), SecretRefError> {
        if self.name.is_empty() {
            return Err(SecretRefError::EmptyName);
        }
        if self.namespace.is_empty() {
            return Err(SecretRefError::EmptyNamespace);
        }
        Ok(())
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Store-assigned version of a secret.
///
/// Only compared for equality; two versions say nothing about which one is newer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Returns the version as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ResourceVersion {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ResourceVersion {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<u64> for ResourceVersion {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// A secret as read from the store at one point in time.
///
/// Values are never mutated after they are read: every fetch or notification
/// yields a new `Secret`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    version: ResourceVersion,
    data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// Creates a secret with the given version and data.
    pub fn new(version: impl Into<ResourceVersion>, data: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            version: version.into(),
            data,
        }
    }

    /// Version assigned by the store.
    pub fn version(&self) -> &ResourceVersion {
        &self.version
    }

    /// Returns the raw value of `field`, if present.
    pub fn get(&self, field: &str) -> Option<&[u8]> {
        self.data.get(field).map(Vec::as_slice)
    }

    /// All fields of the secret.
    pub fn data(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.data
    }
}

// Values are credentials; only the field names are printed.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("version", &self.version)
            .field("fields", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}
