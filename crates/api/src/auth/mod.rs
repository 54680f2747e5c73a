//! Authentication primitives.
//!
//! - [`jwt`] -- access-token validation (and issuance, for tooling and tests).

pub mod jwt;
