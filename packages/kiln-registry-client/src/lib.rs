//! Shared type definitions and HTTP client for the stage registry.
//!
//! This crate is split from the engine crate the same way the engine itself
//! is split from its other external collaborators: the wire types here
//! (fingerprints, labels, artifact descriptors) are useful to anyone talking
//! to the registry, while the HTTP client is gated behind the `client`
//! feature so pure consumers of the types don't have to pull in
//! `reqwest`/`tokio`.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! Types here use `#[non_exhaustive]` where construction should go through a
//! constructor or builder rather than a literal, so invariants (e.g. a
//! fingerprint always being exactly 32 bytes) can't be bypassed by callers.

pub mod registry;

use std::fmt;

use color_eyre::eyre::bail;
use serde::{Deserialize, Serialize};
use tap::Pipe;

/// An authentication token for registry API access.
///
/// This type wraps a token string and ensures it is never accidentally
/// leaked in logs or debug output. To access the actual token value, use the
/// `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl std::str::FromStr for Token {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("token cannot be empty");
        }
        String::from(s).pipe(Self).pipe(Ok)
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}
