//! Контекст сессии открытой базы
//!
//! Everything the engine would otherwise keep in process-wide state lives
//! here and is passed into each operation: the cipher and KDF registries,
//! the attachment spill cache, the host's memory predicate and a
//! cancellation token checked between phases.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::crypto::{CipherRegistry, KdfRegistry};
use crate::error::{DatabaseError, Result};
use crate::tree::BinaryCache;

/// Shared flag a host can flip from another thread to abandon a load or save.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DatabaseError::Cancelled);
        }
        Ok(())
    }
}

type MemoryPredicate = Arc<dyn Fn(u64) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct EngineContext {
    ciphers: CipherRegistry,
    kdfs: KdfRegistry,
    cache: Option<Arc<dyn BinaryCache>>,
    memory: MemoryPredicate,
    cancel: CancelToken,
}

impl EngineContext {
    pub fn new() -> Self {
        Self {
            ciphers: CipherRegistry::new(),
            kdfs: KdfRegistry::new(),
            cache: None,
            memory: Arc::new(|_| true),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_ciphers(mut self, ciphers: CipherRegistry) -> Self {
        self.ciphers = ciphers;
        self
    }

    pub fn with_kdfs(mut self, kdfs: KdfRegistry) -> Self {
        self.kdfs = kdfs;
        self
    }

    pub fn with_binary_cache(mut self, cache: Arc<dyn BinaryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// `predicate(len)` answers whether a payload of `len` bytes may stay in
    /// memory. Payloads it rejects go to the binary cache, if one is set.
    pub fn with_memory_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(u64) -> bool + Send + Sync + 'static,
    {
        self.memory = Arc::new(predicate);
        self
    }

    /// Keep attachments in memory up to `limit` bytes each.
    pub fn with_memory_limit(self, limit: u64) -> Self {
        self.with_memory_predicate(move |len| len <= limit)
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn ciphers(&self) -> &CipherRegistry {
        &self.ciphers
    }

    pub fn kdfs(&self) -> &KdfRegistry {
        &self.kdfs
    }

    pub fn binary_cache(&self) -> Option<Arc<dyn BinaryCache>> {
        self.cache.clone()
    }

    pub fn keep_in_memory(&self, len: u64) -> bool {
        (self.memory)(len)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Phase boundary: fails with [`DatabaseError::Cancelled`] once the
    /// token is set.
    pub fn checkpoint(&self, phase: &str) -> Result<()> {
        debug!(phase, "phase boundary");
        self.cancel.check()
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("ciphers", &self.ciphers)
            .field("kdfs", &self.kdfs)
            .field("cache", &self.cache)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_after_cancel() {
        let token = CancelToken::new();
        let ctx = EngineContext::new().with_cancel_token(token.clone());
        assert!(ctx.checkpoint("header").is_ok());
        token.cancel();
        assert!(matches!(ctx.checkpoint("derive"), Err(DatabaseError::Cancelled)));
    }

    #[test]
    fn test_memory_limit() {
        let ctx = EngineContext::new().with_memory_limit(10);
        assert!(ctx.keep_in_memory(10));
        assert!(!ctx.keep_in_memory(11));
        assert!(EngineContext::new().keep_in_memory(u64::MAX));
    }
}
