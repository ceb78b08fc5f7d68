//! Ankor credential library
//!
//! Holds the two security-sensitive stores of the linking pipeline:
//!
//! - **Identity**: an Ed25519 keypair per installation, authenticating this
//!   machine to the remote backup service. The secret key never leaves the
//!   local key file.
//! - **Trust store**: previously accepted remote host fingerprints, used to
//!   detect host-key spoofing on later contacts.

pub mod error;
pub mod identity;
pub mod trust_store;

pub use error::CryptoError;
pub use identity::{IdentityKeyPair, fingerprint_of};
pub use trust_store::{HostRecord, TrustCheck, TrustStore};
