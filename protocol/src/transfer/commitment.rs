//! # Commitment Generator
//!
//! Derives the opaque identifier a hidden transfer is escrowed under:
//!
//! ```text
//! identifier = SHA-256("{sender}:{recipient}:{amount}:{TOKEN}:{salt_hex}:{created_at}")
//! ```
//!
//! Addresses are lowercase, the token is its uppercase symbol, the salt is 64
//! lowercase hex characters and `created_at` is whole Unix seconds. The salt
//! is 256 bits from the OS CSPRNG, drawn fresh on every call, so the same
//! `(sender, recipient, amount, token)` never produces the same identifier
//! twice and nobody without the salt can confirm a guessed recipient.
//!
//! Salt uniqueness is a property of the random source, not of bookkeeping:
//! the generator keeps no history.

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::types::{Address, Amount, ParseError, Salt, Token, TokenRegistry, TransferId};
use crate::config::{COMMITMENT_SEPARATOR, IDENTIFIER_LENGTH, SALT_LENGTH};

/// Input validation failures for identifier generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitmentError {
    /// Sender or recipient is not a well-formed address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Amount is zero.
    #[error("invalid amount: must be positive, got {0}")]
    InvalidAmount(Amount),

    /// Token is not in the registry.
    #[error("unsupported token: {0}")]
    UnsupportedToken(String),
}

impl From<ParseError> for CommitmentError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidAddress(raw) => CommitmentError::InvalidAddress(raw),
            other => CommitmentError::InvalidAddress(other.to_string()),
        }
    }
}

/// Everything the generator hands back for a new transfer.
#[derive(Debug, Clone)]
pub struct Commitment {
    pub identifier: TransferId,
    pub salt: Salt,
    pub created_at: DateTime<Utc>,
    pub sender: Address,
    pub recipient: Address,
    pub amount: Amount,
    pub token: Token,
}

/// Validates transfer parameters and produces salted identifiers.
#[derive(Debug, Clone, Default)]
pub struct CommitmentGenerator {
    registry: TokenRegistry,
}

impl CommitmentGenerator {
    /// Creates a generator that accepts the tokens in `registry`.
    pub fn new(registry: TokenRegistry) -> Self {
        Self { registry }
    }

    /// The supported-token registry.
    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    /// Validates the raw request fields and derives a fresh identifier.
    ///
    /// # Errors
    ///
    /// [`CommitmentError::InvalidAddress`] for a malformed sender or
    /// recipient, [`CommitmentError::InvalidAmount`] for zero, and
    /// [`CommitmentError::UnsupportedToken`] for a symbol outside the
    /// registry. Validation runs before any randomness is drawn.
    pub fn create_identifier(
        &self,
        sender: &str,
        recipient: &str,
        amount: Amount,
        token: &str,
    ) -> Result<Commitment, CommitmentError> {
        let sender: Address = sender.trim().parse()?;
        let recipient: Address = recipient.trim().parse()?;
        if amount == 0 {
            return Err(CommitmentError::InvalidAmount(amount));
        }
        let token = self
            .registry
            .resolve(token)
            .ok_or_else(|| CommitmentError::UnsupportedToken(token.to_string()))?;

        let salt = generate_salt();
        // Commitments bind whole seconds; drop the sub-second part so the
        // stored timestamp and the hashed one are the same value.
        let created_at = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        let identifier = compute_identifier(&sender, &recipient, amount, &token, &salt, created_at);

        Ok(Commitment {
            identifier,
            salt,
            created_at,
            sender,
            recipient,
            amount,
            token,
        })
    }
}

/// Draws a fresh salt from the operating system's CSPRNG.
pub fn generate_salt() -> Salt {
    let mut bytes = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    Salt::from_bytes(bytes)
}

/// The exact byte string that is hashed into an identifier.
pub fn commitment_payload(
    sender: &Address,
    recipient: &Address,
    amount: Amount,
    token: &Token,
    salt: &Salt,
    created_at: DateTime<Utc>,
) -> String {
    let sep = COMMITMENT_SEPARATOR;
    format!(
        "{sender}{sep}{recipient}{sep}{amount}{sep}{token}{sep}{salt}{sep}{ts}",
        salt = salt.to_hex(),
        ts = created_at.timestamp(),
    )
}

/// Pure identifier derivation. Deterministic given all six inputs.
pub fn compute_identifier(
    sender: &Address,
    recipient: &Address,
    amount: Amount,
    token: &Token,
    salt: &Salt,
    created_at: DateTime<Utc>,
) -> TransferId {
    let payload = commitment_payload(sender, recipient, amount, token, salt, created_at);
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();
    let mut output = [0u8; IDENTIFIER_LENGTH];
    output.copy_from_slice(&digest);
    TransferId::from_bytes(output)
}

/// Recomputes the identifier from disclosed parameters and compares.
///
/// Lets a recipient who was told "you have 100 USDC under 0xabc..." check
/// that the identifier really commits to those parameters before trying to
/// claim it.
pub fn verify_commitment(
    identifier: &TransferId,
    sender: &Address,
    recipient: &Address,
    amount: Amount,
    token: &Token,
    salt: &Salt,
    created_at: DateTime<Utc>,
) -> bool {
    compute_identifier(sender, recipient, amount, token, salt, created_at) == *identifier
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";

    fn generator() -> CommitmentGenerator {
        CommitmentGenerator::default()
    }

    #[test]
    fn repeated_calls_never_collide() {
        let gen = generator();
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let c = gen.create_identifier(ALICE, BOB, 1_000, "USDC").unwrap();
            assert!(seen.insert(c.identifier), "identifier repeated");
        }
    }

    #[test]
    fn salts_are_fresh_per_call() {
        let gen = generator();
        let a = gen.create_identifier(ALICE, BOB, 5, "ETH").unwrap();
        let b = gen.create_identifier(ALICE, BOB, 5, "ETH").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.identifier, b.identifier);
    }

    #[test]
    fn identifier_matches_payload_hash() {
        let gen = generator();
        let c = gen.create_identifier(ALICE, BOB, 42, "dai").unwrap();
        assert_eq!(c.token.symbol(), "DAI");
        assert!(verify_commitment(
            &c.identifier,
            &c.sender,
            &c.recipient,
            c.amount,
            &c.token,
            &c.salt,
            c.created_at,
        ));

        // Any change to a bound field breaks verification.
        assert!(!verify_commitment(
            &c.identifier,
            &c.sender,
            &c.recipient,
            c.amount + 1,
            &c.token,
            &c.salt,
            c.created_at,
        ));
        assert!(!verify_commitment(
            &c.identifier,
            &c.recipient,
            &c.sender,
            c.amount,
            &c.token,
            &c.salt,
            c.created_at,
        ));
    }

    #[test]
    fn payload_format_is_stable() {
        let sender: Address = ALICE.parse().unwrap();
        let recipient: Address = BOB.parse().unwrap();
        let token = TokenRegistry::default().resolve("usdc").unwrap();
        let salt = Salt::from_bytes([0xab; SALT_LENGTH]);
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let payload = commitment_payload(&sender, &recipient, 100, &token, &salt, at);
        assert_eq!(
            payload,
            format!("{ALICE}:{BOB}:100:USDC:{}:1700000000", "ab".repeat(32))
        );
    }

    #[test]
    fn mixed_case_addresses_hash_identically() {
        let lower: Address = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd".parse().unwrap();
        let upper: Address = "0xABCDEFABCDEFABCDEFABCDEFABCDEFABCDEFABCD".parse().unwrap();
        let token = TokenRegistry::default().resolve("ETH").unwrap();
        let salt = generate_salt();
        let at = Utc.timestamp_opt(1, 0).unwrap();
        assert_eq!(
            compute_identifier(&lower, &lower, 1, &token, &salt, at),
            compute_identifier(&upper, &upper, 1, &token, &salt, at),
        );
    }

    #[test]
    fn rejects_invalid_inputs() {
        let gen = generator();
        assert!(matches!(
            gen.create_identifier("bob", BOB, 1, "ETH"),
            Err(CommitmentError::InvalidAddress(_))
        ));
        assert!(matches!(
            gen.create_identifier(ALICE, "0x123", 1, "ETH"),
            Err(CommitmentError::InvalidAddress(_))
        ));
        assert_eq!(
            gen.create_identifier(ALICE, BOB, 0, "ETH").unwrap_err(),
            CommitmentError::InvalidAmount(0)
        );
        assert_eq!(
            gen.create_identifier(ALICE, BOB, 1, "DOGE").unwrap_err(),
            CommitmentError::UnsupportedToken("DOGE".into())
        );
    }

    #[test]
    fn created_at_has_whole_seconds() {
        let c = generator().create_identifier(ALICE, BOB, 1, "ETH").unwrap();
        assert_eq!(c.created_at.timestamp_subsec_nanos(), 0);
    }
}
