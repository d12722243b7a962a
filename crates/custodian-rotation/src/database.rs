//! Database login administration for password rotation.
//!
//! Each logical login has two roles, `<base>_a` and `<base>_b`. A rotation
//! sets the new password on whichever role is not in use, so the old
//! credential keeps working until the grace window ends.

use async_trait::async_trait;

use crate::error::Result;

/// Suffixes of the alternating login roles.
pub const ROLE_SUFFIXES: [&str; 2] = ["_a", "_b"];

/// Administers database logins.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Sets `password` on `role` and allows it to log in.
    async fn set_password(&self, role: &str, password: &str) -> Result<()>;

    /// Returns true if `role` can log in with `password`.
    async fn check_login(&self, role: &str, password: &str) -> Result<bool>;

    /// Stops `role` from logging in.
    async fn revoke_login(&self, role: &str) -> Result<()>;
}

/// The role a rotation should write to, given the role currently active.
///
/// With no active role (first rotation) the `_a` role is used.
#[must_use]
pub fn alternate_role(base: &str, active: Option<&str>) -> String {
    let first = format!("{base}{}", ROLE_SUFFIXES[0]);
    match active {
        Some(role) if role == first => format!("{base}{}", ROLE_SUFFIXES[1]),
        _ => first,
    }
}
