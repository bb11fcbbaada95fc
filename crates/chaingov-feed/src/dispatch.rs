//! Stream key → subscribed data products.
//!
//! Built once at startup; dispatch is a map lookup, never a signature
//! string comparison.

use std::collections::BTreeMap;
use std::sync::PoisonError;

use chaingov_core::{FeedEvent, StreamKey};
use chaingov_products::SharedProduct;

use crate::error::FeedError;

#[derive(Default)]
pub struct DispatchTable {
    routes: BTreeMap<StreamKey, Vec<SharedProduct>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `product` to `stream`. Products receive events in
    /// registration order.
    pub fn register(&mut self, stream: StreamKey, product: SharedProduct) {
        self.routes.entry(stream).or_default().push(product);
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamKey> {
        self.routes.keys()
    }

    /// Streams of one chain.
    pub fn streams_for_chain(&self, chain_id: u64) -> Vec<StreamKey> {
        self.routes
            .keys()
            .filter(|k| k.chain_id() == chain_id)
            .cloned()
            .collect()
    }

    pub fn contains(&self, stream: &StreamKey) -> bool {
        self.routes.contains_key(stream)
    }

    pub fn subscribers(&self, stream: &StreamKey) -> usize {
        self.routes.get(stream).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Apply `event` to every product subscribed to `stream`. Stops at the
    /// first product error. Returns how many products handled it.
    pub fn dispatch(&self, stream: &StreamKey, event: &FeedEvent) -> Result<usize, FeedError> {
        let Some(products) = self.routes.get(stream) else {
            return Ok(0);
        };
        for product in products {
            let mut guard = product.write().unwrap_or_else(PoisonError::into_inner);
            guard.handle(event).map_err(|source| FeedError::Product {
                stream: stream.to_string(),
                product: guard.name(),
                source,
            })?;
        }
        Ok(products.len())
    }
}
