//! Trading symbol identifier and the static allow-list.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A trading symbol such as `BTC/USDT`.
///
/// The wire protocol carries the human-readable pair directly rather than
/// an interned instrument id, so this is a thin newtype over `String`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Static allow-list of supported symbols.
    pub const ALLOWED: &'static [&'static str] = &["BTC/USDT"];

    /// Build a `Symbol` without checking the allow-list. Used internally
    /// once a symbol has already been validated.
    pub fn new_unchecked(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Validate `raw` against the allow-list, returning `None` if it is not
    /// a supported symbol.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALLOWED
            .iter()
            .find(|&&s| s == raw)
            .map(|&s| Self(s.to_string()))
    }

    /// Render the static allow-list for error messages.
    pub fn allowed_list() -> String {
        Self::ALLOWED.join(", ")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
