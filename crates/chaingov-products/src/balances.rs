//! Token balances folded from `Transfer`.

use alloy_primitives::{I256, U256};
use chaingov_core::{FeedEvent, LogEvent, Signature, TokenKind, ZERO_ADDRESS};
use serde_json::json;
use std::collections::HashMap;

use crate::{require_address, unexpected, DataProduct, ProductError};

/// address → signed balance.
///
/// Balances are signed so that a mint from the zero address shows up as a
/// negative zero-address balance and the sum over all addresses stays zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balances {
    kind: TokenKind,
    value_field: Option<String>,
    balances: HashMap<String, I256>,
}

impl Balances {
    pub fn new(kind: TokenKind) -> Self {
        Self { kind, value_field: None, balances: HashMap::new() }
    }

    /// Read the ERC-20 amount from `field` instead of `value` / `amount`.
    pub fn with_value_field(mut self, field: impl Into<String>) -> Self {
        self.value_field = Some(field.into());
        self
    }

    pub fn balance_of(&self, address: &str) -> I256 {
        self.balances
            .get(&address.to_ascii_lowercase())
            .copied()
            .unwrap_or(I256::ZERO)
    }

    /// Addresses with a positive balance, largest first.
    pub fn holders(&self) -> Vec<(&str, I256)> {
        let mut out: Vec<_> = self
            .balances
            .iter()
            .filter(|(a, b)| a.as_str() != ZERO_ADDRESS && b.is_positive())
            .map(|(a, b)| (a.as_str(), *b))
            .collect();
        out.sort_by(|x, y| y.1.cmp(&x.1).then_with(|| x.0.cmp(y.0)));
        out
    }

    /// Number of addresses ever touched, including the zero address.
    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    /// Net minted supply: the negated zero-address balance.
    pub fn total_supply(&self) -> U256 {
        let zero = self.balance_of(ZERO_ADDRESS);
        if zero.is_negative() {
            zero.unsigned_abs()
        } else {
            U256::ZERO
        }
    }

    /// Sum over every tracked address. Zero for a token minted only from
    /// the zero address.
    pub fn sum(&self) -> I256 {
        self.balances.values().fold(I256::ZERO, |acc, b| acc.wrapping_add(*b))
    }

    fn amount(&self, log: &LogEvent) -> Result<I256, ProductError> {
        if self.kind == TokenKind::Erc721 {
            return Ok(I256::ONE);
        }
        let value = match &self.value_field {
            Some(f) => log.uint(f),
            None => log.uint("value").or_else(|| log.uint("amount")),
        };
        let value = value.ok_or_else(|| {
            ProductError::missing(log, self.value_field.as_deref().unwrap_or("value"))
        })?;
        Ok(I256::from_raw(value))
    }

    fn apply(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let from = require_address(log, "from")?.to_string();
        let to = require_address(log, "to")?.to_string();
        let amount = self.amount(log)?;
        let entry = self.balances.entry(from).or_insert(I256::ZERO);
        *entry = entry.wrapping_sub(amount);
        let entry = self.balances.entry(to).or_insert(I256::ZERO);
        *entry = entry.wrapping_add(amount);
        Ok(())
    }
}

impl DataProduct for Balances {
    fn name(&self) -> &'static str {
        "balances"
    }

    fn handle(&mut self, event: &FeedEvent) -> Result<(), ProductError> {
        match event {
            FeedEvent::Block(_) => Ok(()),
            FeedEvent::Log(log) if log.signature == Signature::Transfer => self.apply(log),
            FeedEvent::Log(log) => Err(unexpected(self.name(), log.signature)),
        }
    }

    fn summary(&self) -> serde_json::Value {
        json!({
            "addresses": self.len(),
            "holders": self.holders().len(),
            "total_supply": self.total_supply().to_string(),
        })
    }
}
