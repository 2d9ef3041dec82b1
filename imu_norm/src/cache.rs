//! Memoization of [`parse_with`] keyed by upload content.
//!
//! UIs re-run the pipeline whenever a control changes; the bytes are the same
//! each time, so the parse result can be reused. A hit returns exactly what a
//! fresh parse would.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ingest::{parse_with, Ingested};
use crate::{ImuError, IngestConfig};

const DEFAULT_CAPACITY: usize = 4;

type Key = [u8; 32];

#[derive(Debug)]
pub struct ParseCache {
    config: IngestConfig,
    capacity: usize,
    entries: HashMap<Key, Arc<Ingested>>,
    order: VecDeque<Key>,
}

impl Default for ParseCache {
    fn default() -> Self {
        Self::new(IngestConfig::default())
    }
}

impl ParseCache {
    pub fn new(config: IngestConfig) -> Self {
        Self::with_capacity(config, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(config: IngestConfig, capacity: usize) -> Self {
        Self {
            config,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Cached parse of `raw`. Failures are not cached.
    pub fn get_or_parse(&mut self, raw: &[u8]) -> Result<Arc<Ingested>, ImuError> {
        let key: Key = Sha256::digest(raw).into();
        if let Some(hit) = self.entries.get(&key) {
            debug!(bytes = raw.len(), "parse cache hit");
            return Ok(Arc::clone(hit));
        }

        let ingested = Arc::new(parse_with(raw, &self.config)?);
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key);
        self.entries.insert(key, Arc::clone(&ingested));
        Ok(ingested)
    }
}

/// Lowercase hex SHA-256 of an upload; stable across runs, usable as a file name.
pub fn content_digest(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
