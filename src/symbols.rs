//! Canonical symbol resolution and market classification.
//!
//! This is the only place market inference lives. Everything downstream
//! works with a resolved [`Symbol`]; raw user input never leaks past
//! [`resolve`].

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::Market;

lazy_static! {
    /// Six digits with an optional exchange suffix, e.g. `000001` or `600519.SH`.
    static ref A_SHARE_RE: Regex = Regex::new(r"^([0-9]{6})(?:\.(SH|SZ|BJ))?$").unwrap();
    /// Chinese futures contract code, e.g. `cu2409`, `IF2406`, `SC2312`.
    static ref FUTURES_RE: Regex = Regex::new(r"^[A-Za-z]{1,2}[0-9]{3,4}$").unwrap();
    /// Crypto pair against a quote currency, e.g. `BTCUSDT`, `ETH-USD`.
    static ref CRYPTO_RE: Regex = Regex::new(r"^[A-Z0-9]{2,10}[-/]?(USDT|USD|USDC|BTC|ETH)$").unwrap();
    /// Plain US ticker.
    static ref US_RE: Regex = Regex::new(r"^[A-Z]{1,5}(\.[A-Z])?$").unwrap();
}

/// A canonical market identifier: normalized code plus resolved market.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub code: String,
    pub market: Market,
}

impl Symbol {
    pub fn new(code: impl Into<String>, market: Market) -> Self {
        Self {
            code: code.into(),
            market,
        }
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code)
    }
}

/// Map a six-digit A-share code to its exchange suffix.
///
/// 60xxxx/68xxxx list in Shanghai, 00xxxx/30xxxx in Shenzhen, 4xxxxx/8xxxxx
/// on the Beijing exchange.
fn a_share_exchange(code: &str) -> &'static str {
    match code.as_bytes().first() {
        Some(b'6') => "SH",
        Some(b'4') | Some(b'8') => "BJ",
        _ => "SZ",
    }
}

/// Resolve raw user input to a canonical [`Symbol`].
///
/// Deterministic and idempotent: feeding a canonical code back in returns
/// the same symbol. Returns `None` when the input matches no market grammar.
pub fn resolve(raw: &str) -> Option<Symbol> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(caps) = A_SHARE_RE.captures(trimmed) {
        let code = caps.get(1).map(|m| m.as_str())?;
        let exchange = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| a_share_exchange(code).to_string());
        return Some(Symbol::new(format!("{code}.{exchange}"), Market::AShare));
    }

    let upper = trimmed.to_ascii_uppercase();

    if FUTURES_RE.is_match(trimmed) {
        return Some(Symbol::new(upper, Market::Futures));
    }

    if CRYPTO_RE.is_match(&upper) {
        let code = upper.replace(['-', '/'], "");
        return Some(Symbol::new(code, Market::Crypto));
    }

    if US_RE.is_match(&upper) {
        return Some(Symbol::new(upper, Market::UsStock));
    }

    None
}

/// Classify an already-canonical code.
///
/// Contains-dot means A-share, the futures contract grammar means futures,
/// a recognized quote suffix means crypto, anything else defaults to US.
pub fn classify(code: &str) -> Market {
    if code.contains('.') && A_SHARE_RE.is_match(code) {
        return Market::AShare;
    }
    if FUTURES_RE.is_match(code) {
        return Market::Futures;
    }
    if CRYPTO_RE.is_match(&code.to_ascii_uppercase()) {
        return Market::Crypto;
    }
    Market::UsStock
}
