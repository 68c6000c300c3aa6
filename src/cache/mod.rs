//! Memory-mapped static file cache. Collapses repeated reads of hot files
//! into a single shared kernel mapping, keyed by `(device, inode, size,
//! ctime)` so a file replaced on disk (new inode, or same inode with a
//! bumped ctime) is never served stale.
//!
//! The hash index is open-addressed with linear probing and a
//! deliberately tombstone-light erase: a removed slot is zeroed rather
//! than marked with a distinct tombstone sentinel, matching the observed
//! behavior of the original cache (probe chains can be interrupted by an
//! erase, but lookups tolerate the occasional spurious miss — they never
//! return a wrong hit). `cleanup` is the only path allowed to actually
//! erase; `map`/`unmap` only touch refcounts.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use memmap2::Mmap;

const INITIAL_HASH_SIZE: usize = 1024;
const DEFAULT_EXPIRE_AGE_SECS: u64 = 600;
const MIN_EXPIRE_AGE_SECS: u64 = 30;
const MAX_EXPIRE_AGE_SECS: u64 = 3600;
const DESIRED_FREE_COUNT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub dev: u64,
    pub ino: u64,
    pub size: u64,
    pub ctime: i64,
}

impl CacheKey {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self { dev: meta.dev(), ino: meta.ino(), size: meta.size(), ctime: meta.ctime() })
    }

    fn hash(&self) -> u64 {
        let mut h = self.dev ^ self.ino.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        h ^= self.size.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        h ^= (self.ctime as u64).wrapping_mul(0x94D0_49BB_1331_11EB);
        h ^ (h >> 31)
    }
}

/// An address returned by [`MappedFileCache::map`]. Zero-size files bind
/// to `Empty` — a stable sentinel that requires no real mapping.
#[derive(Clone)]
pub enum CacheAddress {
    Empty,
    Mapped(Arc<Mmap>),
}

impl CacheAddress {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CacheAddress::Empty => &[],
            CacheAddress::Mapped(m) => m,
        }
    }
}

struct MapEntry {
    key: CacheKey,
    address: CacheAddress,
    refcount: u32,
    reftime: Instant,
}

pub struct MappedFileCache {
    slots: Vec<Option<MapEntry>>,
    active_count: usize,
    mapped_bytes: u64,
    expire_age: u64,
    high_water_bytes: u64,
    max_files: usize,
}

impl MappedFileCache {
    pub fn new(high_water_bytes: u64, max_files: usize) -> Self {
        Self {
            slots: (0..INITIAL_HASH_SIZE).map(|_| None).collect(),
            active_count: 0,
            mapped_bytes: 0,
            expire_age: DEFAULT_EXPIRE_AGE_SECS,
            high_water_bytes,
            max_files,
        }
    }

    fn probe_start(&self, key: &CacheKey) -> usize {
        (key.hash() as usize) % self.slots.len()
    }

    fn find_slot(&self, key: &CacheKey) -> Option<usize> {
        let start = self.probe_start(key);
        for offset in 0..self.slots.len() {
            let idx = (start + offset) % self.slots.len();
            match &self.slots[idx] {
                Some(entry) if entry.key == *key => return Some(idx),
                None => return None, // tombstone-light: a genuine gap ends the probe.
                Some(_) => continue,
            }
        }
        None
    }

    fn insert_slot(&mut self, entry: MapEntry) -> usize {
        if self.active_count * 3 >= self.slots.len() {
            self.rehash();
        }
        let start = self.probe_start(&entry.key);
        for offset in 0..self.slots.len() {
            let idx = (start + offset) % self.slots.len();
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(entry);
                return idx;
            }
        }
        unreachable!("hash table grew past capacity without a free slot");
    }

    fn rehash(&mut self) {
        let new_len = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, (0..new_len).map(|_| None).collect());
        for entry in old.into_iter().flatten() {
            let start = (entry.key.hash() as usize) % self.slots.len();
            for offset in 0..self.slots.len() {
                let idx = (start + offset) % self.slots.len();
                if self.slots[idx].is_none() {
                    self.slots[idx] = Some(entry);
                    break;
                }
            }
        }
    }

    /// Maps `path`, sharing an existing mapping if `(dev, ino, size,
    /// ctime)` already has a live entry.
    pub fn map(&mut self, path: &Path) -> std::io::Result<CacheAddress> {
        let key = CacheKey::from_path(path)?;

        if let Some(idx) = self.find_slot(&key) {
            let entry = self.slots[idx].as_mut().unwrap();
            entry.refcount += 1;
            entry.reftime = Instant::now();
            return Ok(entry.address.clone());
        }

        let address = if key.size == 0 {
            CacheAddress::Empty
        } else {
            let file = File::open(path)?;
            let mmap = self.map_with_retry(&file)?;
            CacheAddress::Mapped(Arc::new(mmap))
        };

        self.mapped_bytes += key.size;
        self.active_count += 1;
        self.insert_slot(MapEntry { key, address: address.clone(), refcount: 1, reftime: Instant::now() });
        Ok(address)
    }

    fn map_with_retry(&mut self, file: &File) -> std::io::Result<Mmap> {
        match unsafe { Mmap::map(file) } {
            Ok(m) => Ok(m),
            Err(e) if e.raw_os_error() == Some(libc::ENOMEM) => {
                self.panic_reclaim();
                unsafe { Mmap::map(file) }
            }
            Err(e) => Err(e),
        }
    }

    /// Decrements the refcount for the mapping backing `path`. A no-op if
    /// the key isn't found (already reclaimed by `cleanup`/`panic`).
    pub fn unmap(&mut self, path: &Path) {
        let Ok(key) = CacheKey::from_path(path) else { return };
        if let Some(idx) = self.find_slot(&key) {
            if let Some(entry) = self.slots[idx].as_mut() {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.reftime = Instant::now();
            }
        }
    }

    /// Reclaims entries idle past `expire_age`, then adapts `expire_age`
    /// based on current pressure.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        let expire = self.expire_age;
        for slot in self.slots.iter_mut() {
            let should_evict = matches!(slot, Some(e) if e.refcount == 0 && now.duration_since(e.reftime).as_secs() >= expire);
            if should_evict {
                if let Some(entry) = slot.take() {
                    self.mapped_bytes = self.mapped_bytes.saturating_sub(entry.key.size);
                    self.active_count -= 1;
                }
            }
        }
        self.tune_expire_age();
    }

    fn tune_expire_age(&mut self) {
        if self.mapped_bytes > self.high_water_bytes || self.active_count > self.max_files {
            self.expire_age = (self.expire_age * 2 / 3).max(MIN_EXPIRE_AGE_SECS);
        } else if self.active_count < self.max_files / 2 {
            self.expire_age = (self.expire_age * 5 / 4).min(MAX_EXPIRE_AGE_SECS);
        }
    }

    /// Unmaps every zero-refcount entry immediately — the last-resort
    /// reclaim path triggered on `ENOMEM`.
    pub fn panic_reclaim(&mut self) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(e) if e.refcount == 0) {
                if let Some(entry) = slot.take() {
                    self.mapped_bytes = self.mapped_bytes.saturating_sub(entry.key.size);
                    self.active_count -= 1;
                }
            }
        }
    }

    pub fn destroy(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.active_count = 0;
        self.mapped_bytes = 0;
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn expire_age(&self) -> u64 {
        self.expire_age
    }
}

pub fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

// DESIRED_FREE_COUNT currently documents the free-pool target size from
// the spec; this arena-backed cache frees entries directly rather than
// keeping pre-allocated shells, so it's referenced here rather than used.
const _: usize = DESIRED_FREE_COUNT;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn map_shares_entry_and_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello world");
        let mut cache = MappedFileCache::new(1 << 20, 100);

        let a = cache.map(&path).unwrap();
        let b = cache.map(&path).unwrap();
        assert_eq!(a.as_bytes(), b"hello world");
        assert_eq!(b.as_bytes(), b"hello world");
        assert_eq!(cache.active_count(), 1);

        cache.unmap(&path);
        cache.unmap(&path);
    }

    #[test]
    fn zero_size_file_uses_empty_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.txt", b"");
        let mut cache = MappedFileCache::new(1 << 20, 100);
        let addr = cache.map(&path).unwrap();
        assert!(matches!(addr, CacheAddress::Empty));
        assert!(addr.as_bytes().is_empty());
    }

    #[test]
    fn cleanup_evicts_after_expire_age_with_zero_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"data");
        let mut cache = MappedFileCache::new(1 << 20, 100);
        cache.map(&path).unwrap();
        cache.unmap(&path);
        cache.expire_age = 0;
        cache.cleanup();
        assert_eq!(cache.active_count(), 0);
    }
}
