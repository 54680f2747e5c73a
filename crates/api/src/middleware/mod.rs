//! Authentication and authorization extractors.
//!
//! - [`auth::AuthUser`] -- the caller resolved from a Bearer token.
//! - [`auth::WsAuthUser`] -- same, also accepting `?token=` for WebSocket upgrades.
//! - [`rbac::RequireAdmin`] -- requires the `admin` role.
//! - [`rbac::RequireOperator`] -- requires `operator` or `admin`.

pub mod auth;
pub mod rbac;
