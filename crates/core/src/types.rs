use std::fmt;
use std::str::FromStr;

pub use alloy_primitives::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Upper bound on the username part; placeholder handles such as
/// `@unknown_<author id>` are longer than real platform usernames.
const MAX_USERNAME_LEN: usize = 50;

/// Canonical account handle: the mention sigil followed by the lowercase username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    /// Normalise raw input (`Alice`, `@Alice`, ` @alice `) into `@alice`.
    ///
    /// Returns `None` when the username is empty, too long, or contains
    /// characters outside `[A-Za-z0-9_]`.
    pub fn parse(raw: &str) -> Option<Self> {
        let username = raw.trim().trim_start_matches('@');
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return None;
        }
        if !username
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return None;
        }
        Some(Self(format!("@{}", username.to_ascii_lowercase())))
    }

    /// The handle including the leading `@`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The handle without the leading `@`.
    pub fn username(&self) -> &str {
        &self.0[1..]
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Handle::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid handle `{raw}`")))
    }
}

// ─── Token ──────────────────────────────────────────────────────────────────

/// Assets the bot can move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Token {
    /// Native BNB; the default when a command names no token.
    #[default]
    Bnb,
    /// BEP-20 USDC.
    Usdc,
}

impl Token {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Bnb => "BNB",
            Self::Usdc => "USDC",
        }
    }

    pub fn is_native(self) -> bool {
        matches!(self, Self::Bnb)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Token {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BNB" => Ok(Self::Bnb),
            "USDC" => Ok(Self::Usdc),
            other => Err(AmountError::UnknownToken(other.to_string())),
        }
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ─── CustodialWallet ────────────────────────────────────────────────────────

/// An on-chain address together with the encrypted key that controls it.
///
/// The two halves only ever travel together.
#[derive(Clone, PartialEq, Eq)]
pub struct CustodialWallet {
    pub address: Address,
    pub encrypted_key: String,
}

impl fmt::Debug for CustodialWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustodialWallet")
            .field("address", &self.address)
            .field("encrypted_key", &"<redacted>")
            .finish()
    }
}

// ─── Amount ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("`{0}` is not a decimal amount")]
    Invalid(String),

    #[error("`{0}` has more than 18 fractional digits")]
    TooPrecise(String),

    #[error("`{0}` does not fit in 256 bits")]
    Overflow(String),

    #[error("unknown token `{0}`")]
    UnknownToken(String),
}

/// A token quantity in base units (18 decimals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(U256);

impl Amount {
    pub const DECIMALS: usize = 18;
    pub const ZERO: Self = Self(U256::ZERO);

    pub fn from_base_units(units: U256) -> Self {
        Self(units)
    }

    pub fn base_units(self) -> U256 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Parse human decimal text such as `0.5` or `12`.
    pub fn parse_decimal(text: &str) -> Result<Self, AmountError> {
        let text = text.trim();
        let (whole, frac) = text.split_once('.').unwrap_or((text, ""));
        let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || !digits(whole) || !digits(frac) || text.ends_with('.') {
            return Err(AmountError::Invalid(text.to_string()));
        }
        if frac.len() > Self::DECIMALS {
            return Err(AmountError::TooPrecise(text.to_string()));
        }
        let padded = format!("{whole}{frac:0<width$}", width = Self::DECIMALS);
        U256::from_str_radix(&padded, 10)
            .map(Self)
            .map_err(|_| AmountError::Overflow(text.to_string()))
    }

    /// Parse the base-unit integer representation used in storage.
    pub fn from_base_str(text: &str) -> Result<Self, AmountError> {
        let text = text.trim();
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::Invalid(text.to_string()));
        }
        U256::from_str_radix(text, 10)
            .map(Self)
            .map_err(|_| AmountError::Overflow(text.to_string()))
    }

    /// Base-unit integer representation used in storage.
    pub fn to_base_string(self) -> String {
        self.0.to_string()
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Amount::saturating_add)
    }
}

impl fmt::Display for Amount {
    /// Human decimal without trailing zeros (`0.5`, `2`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.0.to_string();
        let padded = format!("{digits:0>width$}", width = Self::DECIMALS + 1);
        let (whole, frac) = padded.split_at(padded.len() - Self::DECIMALS);
        let frac = frac.trim_end_matches('0');
        if frac.is_empty() {
            f.write_str(whole)
        } else {
            write!(f, "{whole}.{frac}")
        }
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Amount::parse_decimal(&raw).map_err(serde::de::Error::custom)
    }
}
