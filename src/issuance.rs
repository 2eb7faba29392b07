//! Credential issuance: protocol session, reply parsing, persistence
//! and the one-shot facade over all of it.

pub mod facade;
pub mod markup;
pub mod response;
pub mod session;
pub mod store;

pub use facade::CredentialFactory;
pub use session::{IssuanceSession, IssuedCredential};
