//! Masking for the proof API key and other configuration secrets
//!
//! A [`Redacted`] value can travel through `tracing` fields, `{:?}` dumps of
//! [`BridgeConfig`](crate::config::BridgeConfig) and JSON snapshots without
//! leaking. Reading it back requires an explicit [`Redacted::expose`], which
//! keeps every use of the raw secret greppable.

use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MASK: &str = "<redacted>";

/// Secret that prints and serializes as `<redacted>`
///
/// ```ignore
/// use bridge_core::redact::Redacted;
///
/// let key = Redacted::from("sk-12345".to_string());
/// tracing::info!(api_key = %key, "Backend configured");
/// // Logs: api_key = <redacted>
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Redacted<T>(pub T);

impl<T> Redacted<T> {
    /// Borrow the secret. Callers must not log the result.
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Redacted<T> {
    fn from(secret: T) -> Self {
        Redacted(secret)
    }
}

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl<T> Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl<T> Serialize for Redacted<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(MASK)
    }
}

// Reading is transparent so keys can come from JSON config files.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Redacted<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Redacted)
    }
}
