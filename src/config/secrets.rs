//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers can build configs with a
//! `SecretString` password without a direct secrecy dependency.

pub use secrecy::{ExposeSecret, SecretString};
