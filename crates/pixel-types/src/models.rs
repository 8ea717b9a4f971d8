use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static COLOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("color pattern is valid"));

const MAX_USERNAME_LEN: usize = 32;

/// Rejected input, caught before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid color {0:?}: expected #RRGGBB")]
    Color(String),
    #[error("invalid username {0:?}: must be 1-{MAX_USERNAME_LEN} non-blank characters")]
    Username(String),
    #[error("invalid user id: must not be empty")]
    UserId,
}

/// Grid coordinate. Ordered x-major so a column of the grid is a contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub x: i32,
    pub y: i32,
}

impl CellKey {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An RGB color in `#RRGGBB` form. Construction validates, so every `Color` in
/// the system satisfies the storage rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl Color {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if COLOR_RE.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ValidationError::Color(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Color {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque, client-generated user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for a new user.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.trim().is_empty() {
            return Err(ValidationError::UserId);
        }
        Ok(())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One painted pixel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
    pub color: Color,
    pub user_id: UserId,
    pub last_updated: DateTime<Utc>,
}

impl Cell {
    pub fn new(key: CellKey, color: Color, user_id: UserId, last_updated: DateTime<Utc>) -> Self {
        Self {
            x: key.x,
            y: key.y,
            color,
            user_id,
            last_updated,
        }
    }

    pub fn key(&self) -> CellKey {
        CellKey::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub pixels_placed: i64,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    let trimmed = username.trim();
    if trimmed.is_empty() || trimmed != username || username.chars().count() > MAX_USERNAME_LEN {
        return Err(ValidationError::Username(username.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_accepts_six_hex_digits_in_either_case() {
        assert!(Color::parse("#FF0000").is_ok());
        assert!(Color::parse("#a1b2c3").is_ok());
    }

    #[test]
    fn color_rejects_malformed_values() {
        for raw in ["FF0000", "#FFF", "#GG0000", "#FF00001", " #FF0000", ""] {
            assert_eq!(
                Color::parse(raw),
                Err(ValidationError::Color(raw.to_string())),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn color_deserialization_validates() {
        let ok: Result<Color, _> = serde_json::from_str("\"#00ff00\"");
        assert!(ok.is_ok());
        let bad: Result<Color, _> = serde_json::from_str("\"green\"");
        assert!(bad.is_err());
    }

    #[test]
    fn cell_keys_order_by_column_then_row() {
        let mut keys = vec![CellKey::new(1, -5), CellKey::new(0, 9), CellKey::new(1, -6)];
        keys.sort();
        assert_eq!(keys, vec![CellKey::new(0, 9), CellKey::new(1, -6), CellKey::new(1, -5)]);
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("bob").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("  ").is_err());
        assert!(validate_username(" bob").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
    }
}
