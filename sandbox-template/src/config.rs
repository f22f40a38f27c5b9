use secrecy::{ExposeSecret, SecretString};
use std::{env, fmt};

use crate::error::{Error, Result};

pub const CREDENTIALS_VAR: &str = "SANDBOX_CREDENTIALS";

/// Registry credential in `user:password` form.
pub struct Credential(SecretString);

impl Credential {
    pub fn parse(value: &str) -> Result<Credential> {
        let value = value.trim();

        match value.find(':') {
            Some(index) if index > 0 && index + 1 < value.len() => {
                Ok(Credential(SecretString::from(value.to_string())))
            }
            _ => Err(Error::Configuration(format!(
                "{} must have the form `user:password`",
                CREDENTIALS_VAR
            ))),
        }
    }

    /// Reads the credential from the process environment.
    pub fn from_env() -> Result<Credential> {
        match env::var(CREDENTIALS_VAR) {
            Ok(value) => Credential::parse(&value),
            Err(env::VarError::NotPresent) => Err(Error::Configuration(format!(
                "{} is not set; export it as `user:password` for the image registry before running this command",
                CREDENTIALS_VAR
            ))),
            Err(env::VarError::NotUnicode(_)) => Err(Error::Configuration(format!(
                "{} is not valid unicode",
                CREDENTIALS_VAR
            ))),
        }
    }

    pub fn user(&self) -> &str {
        let value = self.0.expose_secret();
        value.split(':').next().unwrap_or(value)
    }

    pub(crate) fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({}:***)", self.user())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_and_password() {
        let credential = Credential::parse("builder:s3cret:with:colons").unwrap();

        assert_eq!(credential.user(), "builder");
        assert_eq!(credential.expose(), "builder:s3cret:with:colons");
    }

    #[test]
    fn rejects_malformed_credentials() {
        for value in &["", "   ", "nopassword", ":password", "user:"] {
            let err = Credential::parse(value).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{:?}", value);
        }
    }

    #[test]
    fn debug_hides_the_password() {
        let credential = Credential::parse("builder:s3cret").unwrap();
        let debug = format!("{:?}", credential);

        assert!(debug.contains("builder"));
        assert!(!debug.contains("s3cret"));
    }
}
