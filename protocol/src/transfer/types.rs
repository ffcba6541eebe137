//! Core type definitions for hidden transfers.
//!
//! These are the values that flow between the generator, the index, the
//! ledger, and the API: addresses, token symbols, transfer identifiers,
//! salts, and the off-ledger status of a transfer. Each one parses from and
//! renders to the same text form used on the wire, so a value that made it
//! into one of these types has already been validated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::{ADDRESS_LENGTH, DEFAULT_TOKENS, IDENTIFIER_LENGTH, SALT_LENGTH};

/// Token amounts in the token's smallest unit (wei, micro-USDC, ...).
///
/// 128 bits because 18-decimal tokens overflow `u64` at ~18.4 whole units.
pub type Amount = u128;

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

/// Errors produced when parsing the textual form of a protocol value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Not `0x` followed by 40 hex characters.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Not a 32-byte hex identifier.
    #[error("invalid transfer identifier: {0}")]
    InvalidIdentifier(String),

    /// Not a 32-byte hex salt.
    #[error("invalid salt: expected {SALT_LENGTH} hex-encoded bytes")]
    InvalidSalt,
}

/// Decodes an optionally `0x`-prefixed hex string into exactly `N` bytes.
fn decode_fixed<const N: usize>(s: &str) -> Option<[u8; N]> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(digits, &mut out).ok()?;
    Some(out)
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A 20-byte account address.
///
/// Parsing requires the `0x` prefix and accepts either hex case; the
/// canonical rendering is lowercase, which is also the form hashed into
/// commitments.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    /// Wraps raw address bytes.
    pub const fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes. Used as the key prefix of the recipient index.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Returns `true` if `s` is a well-formed address.
    pub fn is_valid(s: &str) -> bool {
        s.parse::<Address>().is_ok()
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ParseError::InvalidAddress(s.to_string()))?;
        if digits.len() != ADDRESS_LENGTH * 2 {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }
        let mut out = [0u8; ADDRESS_LENGTH];
        hex::decode_to_slice(digits, &mut out)
            .map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        Ok(Self(out))
    }
}

impl TryFrom<String> for Address {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// An uppercase token symbol such as `USDC`.
///
/// Obtain one through [`TokenRegistry::resolve`] so that only supported
/// assets enter the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// The symbol as stored and hashed.
    pub fn symbol(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of assets the protocol accepts, keyed by symbol.
#[derive(Debug, Clone)]
pub struct TokenRegistry {
    /// symbol -> decimals
    tokens: BTreeMap<String, u8>,
}

impl TokenRegistry {
    /// An empty registry. Every token is unsupported until registered.
    pub fn empty() -> Self {
        Self {
            tokens: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a supported token.
    pub fn register(&mut self, symbol: &str, decimals: u8) -> Token {
        let symbol = symbol.trim().to_uppercase();
        self.tokens.insert(symbol.clone(), decimals);
        Token(symbol)
    }

    /// Looks up a token symbol case-insensitively.
    pub fn resolve(&self, symbol: &str) -> Option<Token> {
        let symbol = symbol.trim().to_uppercase();
        self.tokens.contains_key(&symbol).then_some(Token(symbol))
    }

    /// Decimal places of a supported token.
    pub fn decimals(&self, token: &Token) -> Option<u8> {
        self.tokens.get(token.symbol()).copied()
    }

    /// All supported symbols in alphabetical order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(String::as_str)
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for (symbol, decimals) in DEFAULT_TOKENS {
            registry.register(symbol, *decimals);
        }
        registry
    }
}

// ---------------------------------------------------------------------------
// TransferId
// ---------------------------------------------------------------------------

/// The opaque commitment that identifies a hidden transfer on the ledger.
///
/// Rendered as `0x` + 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransferId([u8; IDENTIFIER_LENGTH]);

impl TransferId {
    /// Wraps a raw digest.
    pub const fn from_bytes(bytes: [u8; IDENTIFIER_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes. Used as the sled key of the record.
    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_LENGTH] {
        &self.0
    }
}

impl FromStr for TransferId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<IDENTIFIER_LENGTH>(s)
            .map(Self)
            .ok_or_else(|| ParseError::InvalidIdentifier(s.to_string()))
    }
}

impl TryFrom<String> for TransferId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransferId> for String {
    fn from(value: TransferId) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({self})")
    }
}

// ---------------------------------------------------------------------------
// Salt
// ---------------------------------------------------------------------------

/// The secret randomness mixed into a commitment.
///
/// Never leaves the off-ledger index except in the response to the sender
/// who created it. `Debug` is redacted so salts don't end up in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Wraps raw salt bytes.
    pub const fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }

    /// Lowercase hex without prefix; the form hashed into commitments.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Salt {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<SALT_LENGTH>(s)
            .map(Self)
            .ok_or(ParseError::InvalidSalt)
    }
}

impl TryFrom<String> for Salt {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Salt> for String {
    fn from(value: Salt) -> Self {
        value.to_hex()
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// TransferStatus
// ---------------------------------------------------------------------------

/// Off-ledger lifecycle state of a transfer.
///
/// `Pending` is the only non-terminal state. A record leaves it exactly
/// once, to whichever of `Claimed` / `Cancelled` the ledger executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Identifier generated; escrow may or may not be confirmed yet.
    Pending,
    /// The escrow was claimed on the ledger.
    Claimed,
    /// The sender reclaimed the escrow after the cancellation window.
    Cancelled,
}

impl TransferStatus {
    /// `true` for `Claimed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Claimed => write!(f, "claimed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
