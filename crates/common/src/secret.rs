//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for store credentials. A Redis URL
//! routinely carries a password (`redis://:hunter2@host:6379`), so it is held
//! as a `SecretString` from the moment it is read out of the environment.
//!
//! `SecretString` implements `Debug` with redaction, so a struct that derives
//! `Debug` while holding one stays safe to log with `{:?}` or tracing.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct StoreSettings {
//!     room_id: String,
//!     url: SecretString,
//! }
//!
//! let settings = StoreSettings {
//!     room_id: "teamspace-main-room".to_string(),
//!     url: SecretString::from("redis://:hunter2@localhost:6379"),
//! };
//!
//! assert!(!format!("{settings:?}").contains("hunter2"));
//! assert!(settings.url.expose_secret().starts_with("redis://"));
//! ```

// Re-export the secret types used by configuration
pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("redis://localhost:6379");
        assert_eq!(secret.expose_secret(), "redis://localhost:6379");
    }

    #[test]
    fn test_store_url_is_redacted_inside_struct() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct StoreSettings {
            room_id: String,
            url: SecretString,
        }

        let settings = StoreSettings {
            room_id: "teamspace-main-room".to_string(),
            url: SecretString::from("redis://:super-secret@cache:6379"),
        };

        let debug_str = format!("{settings:?}");

        assert!(debug_str.contains("teamspace-main-room"));
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("super-secret"));
    }

    #[test]
    fn test_deserialize() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Credentials {
            room_id: String,
            password: SecretString,
        }

        let json = r#"{"room_id": "main", "password": "my-secret-value"}"#;
        let creds: Credentials = serde_json::from_str(json).expect("deserialize");

        assert_eq!(creds.password.expose_secret(), "my-secret-value");

        let debug = format!("{creds:?}");
        assert!(!debug.contains("my-secret-value"));
        assert!(debug.contains("REDACTED"));
    }
}
