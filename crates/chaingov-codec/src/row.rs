//! Text rows: archive CSV records and database rows selected as `::text`.

use chaingov_core::event::snake_case;
use chaingov_core::OrderKey;
use chrono::{DateTime, NaiveDateTime};
use indexmap::IndexMap;
use std::borrow::Cow;

use crate::error::NormalizeError;
use crate::rpc::parse_quantity;

/// One record, column name → raw cell bytes.
///
/// Column names are stored snake_cased so `proposalId` and `proposal_id`
/// headers both resolve. Cells stay bytes until their ABI type is known:
/// string columns may hold invalid UTF-8 that needs repair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextRow {
    cells: IndexMap<String, Vec<u8>>,
}

impl TextRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<Vec<u8>>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut row = Self::new();
        for (k, v) in pairs {
            row.insert(k.as_ref(), v);
        }
        row
    }

    pub fn insert(&mut self, column: &str, value: impl Into<Vec<u8>>) {
        self.cells.insert(snake_case(column.trim()), value.into());
    }

    pub fn with(mut self, column: &str, value: impl Into<Vec<u8>>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&[u8]> {
        self.cells.get(&snake_case(column)).map(Vec::as_slice)
    }

    pub fn text(&self, column: &str) -> Option<Cow<'_, str>> {
        self.get(column).map(String::from_utf8_lossy)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cells.contains_key(&snake_case(column))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// A required integer meta column (`block_number`, `log_index`, ...).
    pub fn quantity(&self, column: &str) -> Result<u64, NormalizeError> {
        let raw = self.text(column).ok_or_else(|| NormalizeError::MissingColumn {
            column: column.to_string(),
        })?;
        parse_quantity(raw.trim().trim_end_matches(".0")).ok_or_else(|| NormalizeError::InvalidMeta {
            column: column.to_string(),
            value: raw.into_owned(),
        })
    }

    /// Where an event row sits, when its meta columns parse. Used to place
    /// rows that fail to normalize.
    pub fn log_position(&self) -> Option<OrderKey> {
        Some(OrderKey::log(
            self.quantity("block_number").ok()?,
            self.quantity("transaction_index").ok()?,
            self.quantity("log_index").ok()?,
        ))
    }

    /// Block timestamp: unix seconds, or a Postgres/ISO-8601 timestamp.
    pub fn timestamp(&self, column: &str) -> Result<u64, NormalizeError> {
        let raw = self.text(column).ok_or_else(|| NormalizeError::MissingColumn {
            column: column.to_string(),
        })?;
        let s = raw.trim();
        parse_quantity(s)
            .or_else(|| parse_datetime(s))
            .ok_or_else(|| NormalizeError::InvalidMeta {
                column: column.to_string(),
                value: s.to_string(),
            })
    }
}

fn parse_datetime(s: &str) -> Option<u64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return u64::try_from(dt.timestamp()).ok();
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return u64::try_from(dt.timestamp()).ok();
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return u64::try_from(dt.and_utc().timestamp()).ok();
        }
    }
    None
}
