//! Deduplicated attachment and icon storage
//!
//! Payloads are keyed by a small integer (attachments) or a UUID (custom
//! icons) and deduplicated by SHA-256. Each payload counts the nodes that
//! point at it and is dropped only when that count reaches zero. Large
//! payloads can be spilled to a [`BinaryCache`] when the host's memory
//! predicate says so.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::crypto::{sha256, CipherEngine, CipherSuite, SecureBytes};
use crate::error::{DatabaseError, Result};

/// Storage for payloads that should not stay in memory.
pub trait BinaryCache: Send + Sync + fmt::Debug {
    fn put(&self, id: &str, data: &mut dyn Read) -> Result<()>;

    fn get(&self, id: &str) -> Result<Box<dyn Read + Send>>;

    fn remove(&self, id: &str) -> Result<()>;
}

/// Spills payloads into files under a scratch directory, encrypted with a
/// per-session ChaCha20 key so nothing lands on disk in the clear.
pub struct ScratchDirCache {
    dir: PathBuf,
    key: SecureBytes,
}

impl ScratchDirCache {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            dir,
            key: SecureBytes::random(32),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", id))
    }

    fn nonce(id: &str) -> [u8; 12] {
        let digest = sha256(id.as_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest[..12]);
        nonce
    }
}

impl fmt::Debug for ScratchDirCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchDirCache").field("dir", &self.dir).finish()
    }
}

impl BinaryCache for ScratchDirCache {
    fn put(&self, id: &str, data: &mut dyn Read) -> Result<()> {
        let mut plain = Vec::new();
        data.read_to_end(&mut plain)?;
        let plain = SecureBytes::new(plain);
        let sealed = CipherSuite::ChaCha20.encrypt_all(&self.key, &Self::nonce(id), &plain)?;

        let path = self.path(id);
        let mut file = File::create(&path)?;
        file.write_all(&sealed)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        let sealed = fs::read(self.path(id))?;
        let plain = CipherSuite::ChaCha20.decrypt_all(&self.key, &Self::nonce(id), &sealed)?;
        Ok(Box::new(std::io::Cursor::new(plain)))
    }

    fn remove(&self, id: &str) -> Result<()> {
        let path = self.path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Process-independent counter for spill file names.
static SPILL_COUNTER: AtomicU64 = AtomicU64::new(0);

enum Storage {
    Memory(SecureBytes),
    Spilled { id: String, cache: Arc<dyn BinaryCache> },
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Storage::Spilled { id, cache } = self {
            if let Err(e) = cache.remove(id) {
                warn!(id = %id, error = %e, "failed to remove spilled binary");
            }
        }
    }
}

pub struct PooledBinary {
    hash: [u8; 32],
    len: u64,
    protected: bool,
    refs: usize,
    storage: Storage,
}

impl PooledBinary {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, Storage::Spilled { .. })
    }

    pub fn data(&self) -> Result<SecureBytes> {
        match &self.storage {
            Storage::Memory(bytes) => Ok(bytes.clone()),
            Storage::Spilled { id, cache } => {
                let mut out = Vec::with_capacity(self.len as usize);
                cache.get(id)?.read_to_end(&mut out)?;
                Ok(SecureBytes::new(out))
            }
        }
    }
}

impl fmt::Debug for PooledBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBinary")
            .field("len", &self.len)
            .field("protected", &self.protected)
            .field("refs", &self.refs)
            .field("spilled", &self.is_spilled())
            .finish()
    }
}

/// Key allocation for pools that hand out their own keys.
pub trait PoolKey: Copy + Ord + fmt::Debug {
    fn next_after(last: Option<&Self>) -> Self;
}

impl PoolKey for u32 {
    fn next_after(last: Option<&Self>) -> Self {
        last.map_or(0, |k| k.wrapping_add(1))
    }
}

impl PoolKey for Uuid {
    fn next_after(_: Option<&Self>) -> Self {
        Uuid::new_v4()
    }
}

pub struct BinaryPool<K: PoolKey> {
    items: BTreeMap<K, PooledBinary>,
    by_hash: HashMap<[u8; 32], K>,
}

impl<K: PoolKey> Default for BinaryPool<K> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            by_hash: HashMap::new(),
        }
    }
}

impl<K: PoolKey> fmt::Debug for BinaryPool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.items.iter()).finish()
    }
}

impl<K: PoolKey> BinaryPool<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&PooledBinary> {
        self.items.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.items.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &PooledBinary)> {
        self.items.iter()
    }

    pub fn data(&self, key: &K) -> Result<SecureBytes> {
        self.items
            .get(key)
            .ok_or_else(|| DatabaseError::NodeNotFound(format!("вложение {:?}", key)))?
            .data()
    }

    pub fn total_size(&self) -> u64 {
        self.items.values().map(|b| b.len).sum()
    }

    fn store(content: &[u8], ctx: &EngineContext) -> Result<Storage> {
        let len = content.len() as u64;
        match ctx.binary_cache() {
            Some(cache) if !ctx.keep_in_memory(len) => {
                let id = format!(
                    "{:08x}-{:016x}",
                    std::process::id(),
                    SPILL_COUNTER.fetch_add(1, Ordering::Relaxed)
                );
                cache.put(&id, &mut &content[..])?;
                debug!(id = %id, bytes = len, "binary spilled to cache");
                Ok(Storage::Spilled { id, cache })
            }
            _ => Ok(Storage::Memory(SecureBytes::from(content))),
        }
    }

    /// Stores `content` and returns its key, reusing an existing payload
    /// with the same hash. The returned key carries one reference.
    pub fn register(&mut self, content: &[u8], protected: bool, ctx: &EngineContext) -> Result<K> {
        let key = self.register_unreferenced(content, protected, ctx)?;
        self.acquire(&key)?;
        Ok(key)
    }

    /// Like [`register`](Self::register) but without taking a reference;
    /// used while decoding, before any node points at the payload.
    pub fn register_unreferenced(&mut self, content: &[u8], protected: bool, ctx: &EngineContext) -> Result<K> {
        let hash = sha256(content);
        if let Some(key) = self.by_hash.get(&hash) {
            let key = *key;
            if let Some(existing) = self.items.get_mut(&key) {
                existing.protected |= protected;
            }
            return Ok(key);
        }

        let key = K::next_after(self.items.keys().next_back());
        self.put(key, hash, content, protected, ctx)?;
        Ok(key)
    }

    /// Stores `content` under a caller-chosen key (custom icons). Replaces
    /// whatever was stored there, keeping its reference count.
    pub fn insert(&mut self, key: K, content: &[u8], protected: bool, ctx: &EngineContext) -> Result<()> {
        let refs = match self.items.remove(&key) {
            Some(old) => {
                self.by_hash.remove(&old.hash);
                old.refs
            }
            None => 0,
        };
        self.put(key, sha256(content), content, protected, ctx)?;
        if let Some(item) = self.items.get_mut(&key) {
            item.refs = refs;
        }
        Ok(())
    }

    fn put(&mut self, key: K, hash: [u8; 32], content: &[u8], protected: bool, ctx: &EngineContext) -> Result<()> {
        let storage = Self::store(content, ctx)?;
        self.items.insert(
            key,
            PooledBinary {
                hash,
                len: content.len() as u64,
                protected,
                refs: 0,
                storage,
            },
        );
        self.by_hash.entry(hash).or_insert(key);
        Ok(())
    }

    /// Looks up a payload by content.
    pub fn find(&self, content: &[u8]) -> Option<K> {
        self.by_hash.get(&sha256(content)).copied()
    }

    pub fn acquire(&mut self, key: &K) -> Result<()> {
        let item = self
            .items
            .get_mut(key)
            .ok_or_else(|| DatabaseError::NodeNotFound(format!("вложение {:?}", key)))?;
        item.refs += 1;
        Ok(())
    }

    /// Drops one reference; returns `true` when the payload was freed.
    pub fn release(&mut self, key: &K) -> Result<bool> {
        let item = self
            .items
            .get_mut(key)
            .ok_or_else(|| DatabaseError::NodeNotFound(format!("вложение {:?}", key)))?;
        item.refs = item.refs.saturating_sub(1);
        if item.refs > 0 {
            return Ok(false);
        }
        self.remove(key);
        Ok(true)
    }

    pub fn remove(&mut self, key: &K) -> Option<PooledBinary> {
        let item = self.items.remove(key)?;
        if self.by_hash.get(&item.hash) == Some(key) {
            self.by_hash.remove(&item.hash);
        }
        Some(item)
    }

    /// Drops every payload nothing refers to. Returns how many went away.
    pub fn purge_unreferenced(&mut self) -> usize {
        let orphans: Vec<K> = self
            .items
            .iter()
            .filter(|(_, b)| b.refs == 0)
            .map(|(k, _)| *k)
            .collect();
        for key in &orphans {
            self.remove(key);
        }
        orphans.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.by_hash.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_deduplicates_by_content() {
        let ctx = EngineContext::new();
        let mut pool: BinaryPool<u32> = BinaryPool::new();
        let a = pool.register(b"same bytes", false, &ctx).unwrap();
        let b = pool.register(b"same bytes", false, &ctx).unwrap();
        let c = pool.register(b"other", false, &ctx).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(&a).unwrap().refs(), 2);
    }

    #[test]
    fn test_release_frees_only_at_zero() {
        let ctx = EngineContext::new();
        let mut pool: BinaryPool<u32> = BinaryPool::new();
        let key = pool.register(b"payload", false, &ctx).unwrap();
        pool.acquire(&key).unwrap();
        assert!(!pool.release(&key).unwrap());
        assert!(pool.contains(&key));
        assert!(pool.release(&key).unwrap());
        assert!(!pool.contains(&key));
        assert!(pool.find(b"payload").is_none());
        assert!(pool.release(&key).is_err());
    }

    #[test]
    fn test_keys_are_sequential() {
        let ctx = EngineContext::new();
        let mut pool: BinaryPool<u32> = BinaryPool::new();
        assert_eq!(pool.register(b"a", false, &ctx).unwrap(), 0);
        assert_eq!(pool.register(b"b", false, &ctx).unwrap(), 1);
        assert_eq!(pool.register(b"c", false, &ctx).unwrap(), 2);
    }

    #[test]
    fn test_purge_unreferenced() {
        let ctx = EngineContext::new();
        let mut pool: BinaryPool<u32> = BinaryPool::new();
        let kept = pool.register_unreferenced(b"kept", false, &ctx).unwrap();
        pool.register_unreferenced(b"orphan", false, &ctx).unwrap();
        pool.acquire(&kept).unwrap();
        assert_eq!(pool.purge_unreferenced(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_insert_by_uuid_keeps_refs() {
        let ctx = EngineContext::new();
        let mut icons: BinaryPool<Uuid> = BinaryPool::new();
        let id = Uuid::new_v4();
        icons.insert(id, b"png-1", false, &ctx).unwrap();
        icons.acquire(&id).unwrap();
        icons.insert(id, b"png-2", false, &ctx).unwrap();
        assert_eq!(icons.get(&id).unwrap().refs(), 1);
        assert_eq!(&*icons.data(&id).unwrap(), b"png-2");
        assert!(icons.find(b"png-1").is_none());
    }

    #[test]
    fn test_spill_to_scratch_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ScratchDirCache::new(dir.path()).unwrap());
        let ctx = EngineContext::new()
            .with_binary_cache(cache)
            .with_memory_predicate(|len| len < 16);

        let mut pool: BinaryPool<u32> = BinaryPool::new();
        let small = pool.register(b"tiny", false, &ctx).unwrap();
        let big_content = vec![0xC3u8; 4096];
        let big = pool.register(&big_content, true, &ctx).unwrap();

        assert!(!pool.get(&small).unwrap().is_spilled());
        assert!(pool.get(&big).unwrap().is_spilled());
        assert_eq!(&*pool.data(&big).unwrap(), &big_content[..]);

        // On disk the payload is not stored in the clear.
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        assert_ne!(fs::read(&path).unwrap(), big_content);

        pool.release(&big).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
