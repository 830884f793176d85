//! Key storage facade used by the HTTP and admin layers.

mod error;
mod keys;
mod outcome;

pub use error::{StoreError, StoreResult};
pub use keys::KeyStore;
pub use outcome::KeyOutcome;
