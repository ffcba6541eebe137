//! # Protocol Configuration & Constants
//!
//! Every fixed parameter of the Cloak protocol lives here: commitment sizes,
//! the cancellation window, fee bounds, default ports, and the retry policy
//! the coordinator falls back to when nobody configures one.
//!
//! Values that touch the ledger contract (`CANCEL_WINDOW_SECS`,
//! `MAX_FEE_BPS`, `BPS_DENOMINATOR`) are part of the on-ledger rules. Changing
//! them after deployment means every outstanding escrow changes semantics
//! underneath its sender.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Full protocol version string, reported by `/status` and `version`.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Network label used by the node when nothing else is configured.
pub const DEFAULT_NETWORK: &str = "devnet";

// ---------------------------------------------------------------------------
// Commitment Parameters
// ---------------------------------------------------------------------------

/// Salt length in bytes. 32 bytes = 256 bits of entropy from the OS CSPRNG.
pub const SALT_LENGTH: usize = 32;

/// Transfer identifier length in bytes (SHA-256 digest).
pub const IDENTIFIER_LENGTH: usize = 32;

/// Address length in bytes. Addresses are written `0x` + 40 hex characters.
pub const ADDRESS_LENGTH: usize = 20;

/// Hash function used for transfer identifiers. SHA-256 so that identifiers
/// can be recomputed by any EVM-side tooling without extra dependencies.
pub const IDENTIFIER_HASH_FUNCTION: &str = "SHA-256";

/// Field separator inside the commitment payload.
pub const COMMITMENT_SEPARATOR: char = ':';

// ---------------------------------------------------------------------------
// Ledger Rules
// ---------------------------------------------------------------------------

/// Time a sender must wait after publishing before they may cancel and
/// reclaim an unclaimed escrow. Seven days, in ledger seconds.
pub const CANCEL_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Denominator for fee rates: 10_000 basis points = 100%.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Upper bound for the publish fee: 500 bps = 5%.
pub const MAX_FEE_BPS: u32 = 500;

/// Default publish fee: 50 bps = 0.5%.
pub const DEFAULT_FEE_BPS: u32 = 50;

// ---------------------------------------------------------------------------
// Supported Tokens
// ---------------------------------------------------------------------------

/// Tokens accepted out of the box, as `(symbol, decimals)`.
pub const DEFAULT_TOKENS: &[(&str, u8)] = &[
    ("ETH", 18),
    ("WETH", 18),
    ("USDC", 6),
    ("USDT", 6),
    ("DAI", 18),
];

// ---------------------------------------------------------------------------
// Coordinator Defaults
// ---------------------------------------------------------------------------

/// How long the coordinator waits for a publish confirmation before it
/// switches to checking ledger state.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of ledger events pulled per reconciliation batch.
pub const DEFAULT_RECONCILE_BATCH: usize = 512;

/// Number of identifier partitions a reconciliation batch is split across.
pub const DEFAULT_RECONCILE_WORKERS: usize = 4;

/// Interval between reconciliation passes in the node.
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 2_000;

/// Attempts made for an idempotent ledger read before giving up.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// First backoff delay; doubles on every subsequent attempt.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Ceiling for a single backoff delay.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default HTTP API port.
pub const DEFAULT_API_PORT: u16 = 8000;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 9742;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_constants_sanity() {
        assert!(DEFAULT_FEE_BPS <= MAX_FEE_BPS);
        assert!((MAX_FEE_BPS as u128) < BPS_DENOMINATOR);
    }

    #[test]
    fn test_cancel_window_is_seven_days() {
        assert_eq!(CANCEL_WINDOW_SECS, 604_800);
    }

    #[test]
    fn test_commitment_sizes() {
        // 256-bit salt and identifier; anything shorter weakens the commitment.
        assert_eq!(SALT_LENGTH * 8, 256);
        assert_eq!(IDENTIFIER_LENGTH, 32);
        assert_eq!(ADDRESS_LENGTH, 20);
    }

    #[test]
    fn test_retry_delays_ordered() {
        assert!(DEFAULT_RETRY_BASE_DELAY < DEFAULT_RETRY_MAX_DELAY);
        assert!(DEFAULT_RETRY_ATTEMPTS > 0);
    }

    #[test]
    fn test_default_tokens_are_uppercase() {
        for (symbol, _) in DEFAULT_TOKENS {
            assert_eq!(*symbol, symbol.to_uppercase());
        }
    }
}
