//! Chunk cache keyed by the SHA1 of the loaded bytes

use crate::bytecode::{digest, Chunk};
use crate::error::Result;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,

    /// Lookups that had to parse
    pub misses: u64,

    /// Chunks currently cached
    pub entries: usize,
}

/// Parsed chunks by SHA1, so loading the same bytes twice parses once
#[derive(Debug, Default)]
pub struct ChunkCache {
    chunks: HashMap<String, Rc<Chunk>>,
    hits: u64,
    misses: u64,
}

impl ChunkCache {
    /// Create an empty cache
    pub fn new() -> Self {
        ChunkCache::default()
    }

    /// Return the cached chunk for `bytes`, parsing it on a miss
    pub fn load(&mut self, bytes: &[u8]) -> Result<Rc<Chunk>> {
        let sha1 = digest(bytes);
        if let Some(chunk) = self.chunks.get(&sha1) {
            self.hits += 1;
            return Ok(chunk.clone());
        }

        self.misses += 1;
        let chunk = Rc::new(Chunk::from_bytes(bytes)?);
        debug!(sha1 = %sha1, "chunk cached");
        self.chunks.insert(sha1, chunk.clone());
        Ok(chunk)
    }

    /// Look up a chunk by SHA1
    pub fn get(&mut self, sha1: &str) -> Option<Rc<Chunk>> {
        let found = self.chunks.get(&sha1.to_ascii_lowercase()).cloned();
        match found {
            Some(_) => self.hits += 1,
            None => self.misses += 1,
        }
        found
    }

    /// Check which of the given SHA1s are cached
    pub fn exists(&self, sha1s: &[&str]) -> Vec<bool> {
        sha1s
            .iter()
            .map(|s| self.chunks.contains_key(&s.to_ascii_lowercase()))
            .collect()
    }

    /// Drop every cached chunk
    pub fn flush(&mut self) {
        self.chunks.clear();
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.chunks.len(),
        }
    }
}
