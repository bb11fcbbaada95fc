//! Delegation graph and voting power, with point-in-time lookups.
//!
//! Full VP history per delegatee is kept in memory without bound, since capping
//! it would break `vp_at_block` for old blocks. Only the recent window used for
//! the 7-day delta is pruned.

use alloy_primitives::{I256, U256};
use chaingov_core::{BlockEvent, FeedEvent, FieldValue, LogEvent, Signature, ZERO_ADDRESS};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::{require_address, require_uint, unexpected, DataProduct, ProductError};

pub const SEVEN_DAYS_SECS: u64 = 7 * 24 * 3600;
const HOUR_SECS: u64 = 3600;

/// `(block_number, transaction_index)` at which a relation was registered.
pub type Position = (u64, u64);

/// Delegators of one delegatee, ordered by registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DelegatorSet {
    by_delegator: HashMap<String, Position>,
    ordered: BTreeSet<(Position, String)>,
}

impl DelegatorSet {
    fn insert(&mut self, delegator: &str, at: Position) {
        self.remove(delegator);
        self.by_delegator.insert(delegator.to_string(), at);
        self.ordered.insert((at, delegator.to_string()));
    }

    fn remove(&mut self, delegator: &str) -> bool {
        match self.by_delegator.remove(delegator) {
            Some(at) => {
                self.ordered.remove(&(at, delegator.to_string()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.by_delegator.len()
    }
}

/// Memoized "VP 7 days ago", valid for one boundary block.
#[derive(Default)]
struct SevenDayCache(Mutex<(u64, HashMap<String, U256>)>);

impl SevenDayCache {
    fn get_or_compute(&self, boundary: u64, key: &str, f: impl FnOnce() -> U256) -> U256 {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if guard.0 != boundary {
            guard.0 = boundary;
            guard.1.clear();
        }
        *guard.1.entry(key.to_string()).or_insert_with(f)
    }
}

impl Clone for SevenDayCache {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl PartialEq for SevenDayCache {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for SevenDayCache {}

impl fmt::Debug for SevenDayCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SevenDayCache")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegations {
    partial: bool,

    delegators: HashMap<String, DelegatorSet>,
    delegatees: HashMap<String, BTreeSet<String>>,
    first_delegation: HashMap<String, Position>,
    latest_delegation: HashMap<String, Position>,
    /// (delegatee, delegator) → amount, fractional protocols only.
    amounts: HashMap<(String, String), U256>,

    voting_power: HashMap<String, U256>,
    history: HashMap<String, Vec<(u64, U256)>>,
    recent: HashMap<String, VecDeque<(u64, U256)>>,

    current_block: u64,
    current_timestamp: u64,
    current_hour: Option<u64>,
    /// First `(timestamp, block)` seen in each hour, ascending.
    hourly_blocks: Vec<(u64, u64)>,
    seven_days_ago_block: u64,
    cache: SevenDayCache,
}

impl Delegations {
    /// `partial` selects the fractional `DelegateChanged` protocol.
    pub fn new(partial: bool) -> Self {
        Self {
            partial,
            delegators: HashMap::new(),
            delegatees: HashMap::new(),
            first_delegation: HashMap::new(),
            latest_delegation: HashMap::new(),
            amounts: HashMap::new(),
            voting_power: HashMap::new(),
            history: HashMap::new(),
            recent: HashMap::new(),
            current_block: 0,
            current_timestamp: 0,
            current_hour: None,
            hourly_blocks: Vec::new(),
            seven_days_ago_block: 0,
            cache: SevenDayCache::default(),
        }
    }

    // ─── Queries ──────────────────────────────────────────────────────────────

    pub fn voting_power(&self, delegatee: &str) -> U256 {
        self.voting_power
            .get(&delegatee.to_ascii_lowercase())
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// VP in effect at the end of `block`: the last history entry at or
    /// before it, or zero.
    pub fn vp_at_block(&self, delegatee: &str, block: u64) -> U256 {
        self.history
            .get(&delegatee.to_ascii_lowercase())
            .map(|h| {
                let idx = h.partition_point(|(b, _)| *b <= block);
                value_at(idx.checked_sub(1).and_then(|i| h.get(i)))
            })
            .unwrap_or(U256::ZERO)
    }

    /// VP at the 7-day boundary block, from the recent window.
    pub fn vp_seven_days_ago(&self, delegatee: &str) -> U256 {
        let key = delegatee.to_ascii_lowercase();
        let boundary = self.seven_days_ago_block;
        self.cache.get_or_compute(boundary, &key, || match self.recent.get(&key) {
            Some(window) if !window.is_empty() => {
                let idx = window.partition_point(|(b, _)| *b <= boundary);
                value_at(idx.checked_sub(1).and_then(|i| window.get(i)))
            }
            _ => U256::ZERO,
        })
    }

    pub fn vp_change_7d(&self, delegatee: &str) -> I256 {
        let now = I256::from_raw(self.voting_power(delegatee));
        let then = I256::from_raw(self.vp_seven_days_ago(delegatee));
        now.wrapping_sub(then)
    }

    /// Current delegators, oldest registration first.
    pub fn delegators_of(&self, delegatee: &str) -> Vec<(&str, Position)> {
        self.delegators
            .get(&delegatee.to_ascii_lowercase())
            .map(|s| s.ordered.iter().map(|(at, d)| (d.as_str(), *at)).collect())
            .unwrap_or_default()
    }

    pub fn delegator_count(&self, delegatee: &str) -> usize {
        self.delegators
            .get(&delegatee.to_ascii_lowercase())
            .map(DelegatorSet::len)
            .unwrap_or(0)
    }

    pub fn delegatees_of(&self, delegator: &str) -> Vec<&str> {
        self.delegatees
            .get(&delegator.to_ascii_lowercase())
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn first_delegation(&self, delegatee: &str) -> Option<Position> {
        self.first_delegation.get(&delegatee.to_ascii_lowercase()).copied()
    }

    pub fn latest_delegation(&self, delegatee: &str) -> Option<Position> {
        self.latest_delegation.get(&delegatee.to_ascii_lowercase()).copied()
    }

    /// Amount `delegator` currently delegates to `delegatee` (fractional only).
    pub fn delegated_amount(&self, delegatee: &str, delegator: &str) -> U256 {
        self.amounts
            .get(&(delegatee.to_ascii_lowercase(), delegator.to_ascii_lowercase()))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// Every delegatee with nonzero VP at `block`.
    pub fn delegatees_with_vp_at(&self, block: u64) -> Vec<(&str, U256)> {
        let mut out: Vec<_> = self
            .history
            .iter()
            .filter_map(|(d, h)| {
                let idx = h.partition_point(|(b, _)| *b <= block);
                let vp = value_at(idx.checked_sub(1).and_then(|i| h.get(i)));
                (!vp.is_zero()).then_some((d.as_str(), vp))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    pub fn current_block(&self) -> u64 {
        self.current_block
    }

    pub fn current_timestamp(&self) -> u64 {
        self.current_timestamp
    }

    pub fn seven_days_ago_block(&self) -> u64 {
        self.seven_days_ago_block
    }

    pub fn history_len(&self, delegatee: &str) -> usize {
        self.history
            .get(&delegatee.to_ascii_lowercase())
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn recent_len(&self, delegatee: &str) -> usize {
        self.recent
            .get(&delegatee.to_ascii_lowercase())
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    // ─── Block clock ──────────────────────────────────────────────────────────

    fn on_block(&mut self, block: &BlockEvent) {
        self.current_block = block.block_number;
        self.current_timestamp = block.timestamp;

        let hour = block.timestamp / HOUR_SECS;
        if self.current_hour == Some(hour) {
            return;
        }
        self.current_hour = Some(hour);
        self.hourly_blocks.push((block.timestamp, block.block_number));

        let target = block.timestamp.saturating_sub(SEVEN_DAYS_SECS);
        // Descending search for the newest sample at or before the target.
        let found = self
            .hourly_blocks
            .iter()
            .rposition(|(ts, _)| *ts <= target);
        let boundary = found.map(|i| self.hourly_blocks[i].1).unwrap_or(0);
        if let Some(i) = found {
            // Older samples can never be the boundary again.
            self.hourly_blocks.drain(..i);
        }

        if boundary != self.seven_days_ago_block {
            debug!(block = block.block_number, boundary, "7-day boundary moved");
            self.seven_days_ago_block = boundary;
            for window in self.recent.values_mut() {
                prune(window, boundary);
            }
        }
    }

    // ─── Delegation events ────────────────────────────────────────────────────

    fn on_delegate_changed(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let delegator = require_address(log, "delegator")?.to_string();
        let from = require_address(log, "from_delegate")?.to_string();
        let to = require_address(log, "to_delegate")?.to_string();
        let at = log.position();

        if from != ZERO_ADDRESS {
            if let Some(set) = self.delegators.get_mut(&from) {
                set.remove(&delegator);
            }
        }
        let reverse = self.delegatees.entry(delegator.clone()).or_default();
        reverse.clear();
        if to != ZERO_ADDRESS {
            reverse.insert(to.clone());
            self.register(&to, &delegator, at);
        }
        Ok(())
    }

    fn on_partial_delegate_changed(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let delegator = require_address(log, "delegator")?.to_string();
        let old = pairs(log, "old_delegatees")?;
        let new = pairs(log, "new_delegatees")?;
        let at = log.position();

        let mut removed = U256::ZERO;
        for (delegatee, amount) in &old {
            if delegatee == ZERO_ADDRESS {
                continue;
            }
            if let Some(set) = self.delegators.get_mut(delegatee) {
                set.remove(&delegator);
            }
            self.amounts.remove(&(delegatee.clone(), delegator.clone()));
            let vp = self.voting_power.entry(delegatee.clone()).or_default();
            *vp = vp.saturating_sub(*amount);
            removed = removed.saturating_add(*amount);
        }

        let reverse = self.delegatees.entry(delegator.clone()).or_default();
        reverse.clear();
        let mut added = U256::ZERO;
        for (delegatee, amount) in &new {
            if delegatee == ZERO_ADDRESS {
                continue;
            }
            reverse.insert(delegatee.clone());
            added = added.saturating_add(*amount);
        }
        for (delegatee, amount) in new {
            if delegatee == ZERO_ADDRESS {
                continue;
            }
            self.register(&delegatee, &delegator, at);
            let vp = self.voting_power.entry(delegatee.clone()).or_default();
            *vp = vp.saturating_add(amount);
            self.amounts.insert((delegatee, delegator.clone()), amount);
        }
        debug!(%delegator, %removed, %added, "fractional delegation updated");
        Ok(())
    }

    fn register(&mut self, delegatee: &str, delegator: &str, at: Position) {
        self.delegators
            .entry(delegatee.to_string())
            .or_default()
            .insert(delegator, at);
        self.first_delegation.entry(delegatee.to_string()).or_insert(at);
        self.latest_delegation.insert(delegatee.to_string(), at);
    }

    fn on_votes_changed(&mut self, log: &LogEvent) -> Result<(), ProductError> {
        let delegatee = require_address(log, "delegate")?.to_string();
        let vp = require_uint(log, &["new_balance", "new_votes"])?;
        if delegatee == ZERO_ADDRESS {
            return Ok(());
        }
        let block = log.block_number;
        self.voting_power.insert(delegatee.clone(), vp);

        let history = self.history.entry(delegatee.clone()).or_default();
        match history.last().map(|(b, _)| *b) {
            Some(last) if last == block => {
                if let Some(entry) = history.last_mut() {
                    entry.1 = vp;
                }
            }
            Some(last) if last > block => {
                warn!(%delegatee, block, last, "VP history out of order");
                history.push((block, vp));
            }
            _ => history.push((block, vp)),
        }

        // Appended and pruned under the same &mut borrow.
        let window = self.recent.entry(delegatee).or_default();
        if window.back().is_some_and(|(b, _)| *b == block) {
            window.pop_back();
        }
        window.push_back((block, vp));
        prune(window, self.seven_days_ago_block);
        Ok(())
    }
}

/// Value of the entry just before `idx` in a block-sorted sequence.
fn value_at(entry: Option<&(u64, U256)>) -> U256 {
    entry.map(|(_, v)| *v).unwrap_or(U256::ZERO)
}

/// Drop entries strictly superseded before the boundary, keeping one anchor
/// at or before it.
fn prune(window: &mut VecDeque<(u64, U256)>, boundary: u64) {
    while window.len() >= 2 && window[1].0 <= boundary {
        window.pop_front();
    }
}

fn pairs(log: &LogEvent, field: &str) -> Result<Vec<(String, U256)>, ProductError> {
    let items = log
        .field(field)
        .and_then(FieldValue::as_array)
        .ok_or_else(|| ProductError::missing(log, field))?;
    items
        .iter()
        .map(|item| match item.as_array() {
            Some([addr, amount]) => match (addr.as_hex(), amount.as_uint()) {
                (Some(a), Some(v)) => Ok((a.to_ascii_lowercase(), v)),
                _ => Err(ProductError::missing(log, field)),
            },
            _ => Err(ProductError::missing(log, field)),
        })
        .collect()
}

impl DataProduct for Delegations {
    fn name(&self) -> &'static str {
        "delegations"
    }

    fn handle(&mut self, event: &FeedEvent) -> Result<(), ProductError> {
        let log = match event {
            FeedEvent::Block(b) => {
                self.on_block(b);
                return Ok(());
            }
            FeedEvent::Log(log) => log,
        };
        match log.signature {
            Signature::DelegateChanged if !self.partial => self.on_delegate_changed(log),
            Signature::DelegateChangedPartial if self.partial => {
                self.on_partial_delegate_changed(log)
            }
            Signature::DelegateVotesChanged => self.on_votes_changed(log),
            other => Err(unexpected(self.name(), other)),
        }
    }

    fn summary(&self) -> serde_json::Value {
        let with_vp = self.voting_power.values().filter(|v| !v.is_zero()).count();
        let delegators: HashSet<&String> = self
            .delegatees
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(d, _)| d)
            .collect();
        json!({
            "delegatees_with_vp": with_vp,
            "delegators": delegators.len(),
            "current_block": self.current_block,
            "seven_days_ago_block": self.seven_days_ago_block,
        })
    }
}
