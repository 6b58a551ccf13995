//! Room, identity and connection identifiers
//!
//! Room and identity tokens are short strings over a restricted alphabet so
//! they can be read aloud. Uniqueness is probabilistic only.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Default token alphabet (uppercase letters and digits)
pub const DEFAULT_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default token length
pub const DEFAULT_TOKEN_LEN: usize = 8;

/// Fewest distinct tokens a generator may produce.
///
/// Stores retry until they draw an unused token, so a tiny space would
/// stall room creation once it fills.
pub const MIN_TOKEN_SPACE: u128 = 1_000_000;

/// Opaque room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// Opaque per-participant identity token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

macro_rules! token_impls {
    ($ty:ident) => {
        impl $ty {
            pub fn new(token: impl Into<String>) -> Self {
                Self(token.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

token_impls!(RoomId);
token_impls!(IdentityId);

/// Identifies one live signaling connection.
///
/// An identity may reconnect; each transport gets a fresh id so a late
/// disconnect of the old transport can be told apart from the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates room and identity tokens
#[derive(Debug, Clone)]
pub struct TokenGenerator {
    alphabet: Vec<char>,
    length: usize,
}

/// Distinct symbols of `alphabet`, or the default alphabet's when empty
fn distinct_symbols(alphabet: &str) -> Vec<char> {
    let mut symbols: Vec<char> = alphabet.chars().collect();
    symbols.sort_unstable();
    symbols.dedup();
    if symbols.is_empty() {
        symbols = DEFAULT_ALPHABET.chars().collect();
    }
    symbols
}

fn effective_length(length: usize) -> usize {
    if length == 0 {
        DEFAULT_TOKEN_LEN
    } else {
        length
    }
}

/// Number of distinct tokens `TokenGenerator::new(alphabet, length)` could
/// draw before any fallback, saturating at `u128::MAX`
pub fn token_space(alphabet: &str, length: usize) -> u128 {
    let symbols = distinct_symbols(alphabet).len() as u128;
    let length = u32::try_from(effective_length(length)).unwrap_or(u32::MAX);
    symbols.saturating_pow(length)
}

impl TokenGenerator {
    /// Create a generator over `alphabet`.
    ///
    /// Repeated symbols count once. Falls back to the default alphabet when
    /// given an empty one, and to the default length when given zero. If
    /// the result would allow fewer than [`MIN_TOKEN_SPACE`] tokens both
    /// settings revert to the defaults.
    pub fn new(alphabet: &str, length: usize) -> Self {
        let space = token_space(alphabet, length);
        if space < MIN_TOKEN_SPACE {
            warn!(
                alphabet,
                length,
                space = %space,
                "Token settings too small, using defaults"
            );
            return Self::default();
        }
        Self {
            alphabet: distinct_symbols(alphabet),
            length: effective_length(length),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    fn token(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| self.alphabet[rng.gen_range(0..self.alphabet.len())])
            .collect()
    }

    pub fn room_id(&self) -> RoomId {
        RoomId(self.token())
    }

    pub fn identity(&self) -> IdentityId {
        IdentityId(self.token())
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.chars().collect(),
            length: DEFAULT_TOKEN_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_use_alphabet_and_length() {
        let generator = TokenGenerator::default();
        for _ in 0..100 {
            let room = generator.room_id();
            assert_eq!(room.as_str().len(), DEFAULT_TOKEN_LEN);
            assert!(room.as_str().chars().all(|c| DEFAULT_ALPHABET.contains(c)));
        }
    }

    #[test]
    fn test_custom_alphabet() {
        let generator = TokenGenerator::new("AB", 24);
        let id = generator.identity();
        assert_eq!(id.as_str().len(), 24);
        assert!(id.as_str().chars().all(|c| c == 'A' || c == 'B'));
    }

    #[test]
    fn test_repeated_symbols_count_once() {
        assert_eq!(token_space("ABAB", 3), 8);
        assert_eq!(token_space("ABAB", 3), token_space("BA", 3));
        assert_eq!(token_space("", 0), 36u128.pow(8));
        assert_eq!(token_space("0123456789", 200), u128::MAX);

        // Non-adjacent repeats collapse too
        let generator = TokenGenerator::new("ABCA", 20);
        assert_eq!(generator.alphabet, vec!['A', 'B', 'C']);
    }

    #[test]
    fn test_tiny_space_falls_back_to_defaults() {
        let generator = TokenGenerator::new("AAAA", 50);
        assert_eq!(generator.length(), DEFAULT_TOKEN_LEN);
        assert_eq!(generator.alphabet.len(), DEFAULT_ALPHABET.len());

        let generator = TokenGenerator::new("AB", 4);
        assert_eq!(generator.length(), DEFAULT_TOKEN_LEN);
        let room = generator.room_id();
        assert!(room.as_str().chars().all(|c| DEFAULT_ALPHABET.contains(c)));
    }

    #[test]
    fn test_degenerate_settings_fall_back() {
        let generator = TokenGenerator::new("", 0);
        assert_eq!(generator.length(), DEFAULT_TOKEN_LEN);
        assert_eq!(generator.room_id().as_str().len(), DEFAULT_TOKEN_LEN);
    }

    #[test]
    fn test_token_serializes_as_plain_string() {
        let room = RoomId::new("ABCD1234");
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"ABCD1234\"");
    }
}
