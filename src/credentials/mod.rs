//! Credential records.
//!
//! Users live on the secrets branch at `.credentials/<realm>/<username>`,
//! one JSON record each. Each realm has a fixed role vocabulary; see
//! [`Realm::roles`].

mod error;
mod record;
mod store;

pub use error::{CredentialError, CredentialResult};
pub use record::{is_valid_username, CredentialRecord, PasswordSecret, Realm};
pub use store::{CredentialStore, Principal};
