use super::errors::ValidationError;
use crate::connection::Connection;
use crate::BoxError;

/// Decides whether a connection may be handed out.
///
/// A validator runs before a new connection is published and again every time
/// a reader asks for the current connection. It must only probe the
/// connection, never change it.
///
/// Implemented for closures of the matching signature.
///
/// # Example
///
/// ```
/// use credential_monitor::{BoxError, Callbacks, Connection};
///
/// let callbacks = Callbacks::new()
///     .on_credentials_change(|_conn| {})
///     .validate_credentials(|conn: &dyn Connection| -> Result<(), BoxError> {
///         if conn.username().ends_with("@internal") {
///             Ok(())
///         } else {
///             Err("unexpected authentication domain".into())
///         }
///     });
/// ```
pub trait CredentialValidator: Send + Sync + 'static {
    /// Returns `Ok(())` if `connection` is usable.
    ///
    /// # Errors
    ///
    /// Returns the reason the connection is not usable.
    fn validate(&self, connection: &dyn Connection) -> Result<(), BoxError>;
}

impl<F> CredentialValidator for F
where
    F: Fn(&dyn Connection) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn validate(&self, connection: &dyn Connection) -> Result<(), BoxError> {
        self(connection)
    }
}

/// Default validator: runs [`Connection::test`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbeValidator;

impl CredentialValidator for ProbeValidator {
    fn validate(&self, connection: &dyn Connection) -> Result<(), BoxError> {
        connection.test()
    }
}

pub(super) fn run_validator(
    validator: &dyn CredentialValidator,
    connection: &dyn Connection,
) -> Result<(), ValidationError> {
    validator.validate(connection).map_err(ValidationError::new)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use url::Url;

    #[derive(Debug)]
    struct Probe {
        url: Url,
        healthy: bool,
    }

    impl Connection for Probe {
        fn url(&self) -> &Url {
            &self.url
        }
        fn username(&self) -> &str {
            "admin@internal"
        }
        fn test(&self) -> Result<(), BoxError> {
            if self.healthy {
                Ok(())
            } else {
                Err("engine unreachable".into())
            }
        }
    }

    fn probe(healthy: bool) -> Probe {
        Probe {
            url: Url::parse("https://engine.example.com/ovirt-engine/api").unwrap(),
            healthy,
        }
    }

    #[test]
    fn probe_validator_delegates_to_test() {
        assert!(run_validator(&ProbeValidator, &probe(true)).is_ok());

        let err = run_validator(&ProbeValidator, &probe(false)).unwrap_err();
        assert_eq!(err.into_inner().to_string(), "engine unreachable");
    }

    #[test]
    fn closures_are_validators() {
        let reject_all = |_: &dyn Connection| -> Result<(), BoxError> { Err("nope".into()) };
        assert!(run_validator(&reject_all, &probe(true)).is_err());
    }
}
