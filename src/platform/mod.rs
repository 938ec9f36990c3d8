//! Platform backends for the enumeration and policy services.
//!
//! The registry core only consumes the traits in [`crate::enumerator`] and
//! [`crate::policy`]; everything platform-specific lives here.

#[cfg(windows)]
pub mod wasapi;
