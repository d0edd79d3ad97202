//! Sliding window cache over pack files
//!
//! Pack files are large and read at scattered offsets; mapping whole packs
//! is wasteful and reopening them per read is slow. The cache keeps
//! fixed-size byte windows, keyed by (pack, aligned offset), under a byte
//! budget with LRU eviction. A window pinned by a reader (any outstanding
//! `Arc`) is never evicted.
//!
//! Windows hold their own bytes (a private mapping or a heap copy), so a
//! reader keeps seeing consistent data even when the pack's file handle is
//! rotated underneath it.

use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Configuration of the window cache and its dependent limits.
#[derive(Debug, Clone)]
pub struct WindowCacheOptions {
    /// Window stride in bytes; must be a power of two.
    pub window_size: usize,
    /// Total window bytes held before eviction starts.
    pub window_limit: usize,
    /// Map windows with `mmap` instead of heap copies.
    pub mmap: bool,
    /// Bytes of inflated delta bases retained for chain reuse.
    pub delta_base_cache_limit: usize,
    /// Objects larger than this are streamed, never materialized.
    pub stream_file_threshold: u64,
}

impl Default for WindowCacheOptions {
    fn default() -> Self {
        WindowCacheOptions {
            window_size: 8 * 1024,
            window_limit: 10 * 1024 * 1024,
            mmap: cfg!(target_pointer_width = "64"),
            delta_base_cache_limit: 10 * 1024 * 1024,
            stream_file_threshold: 50 * 1024 * 1024,
        }
    }
}

impl WindowCacheOptions {
    /// Validate the option set.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.window_size.is_power_of_two() {
            anyhow::bail!("window size {} is not a power of two", self.window_size);
        }
        if self.window_limit < self.window_size {
            anyhow::bail!(
                "window limit {} is smaller than one window ({})",
                self.window_limit,
                self.window_size
            );
        }
        Ok(())
    }
}

/// One cached byte window of a pack file.
#[derive(Debug)]
pub struct Window {
    start: u64,
    bytes: WindowBytes,
    last_used: AtomicU64,
}

#[derive(Debug)]
enum WindowBytes {
    Mapped(Mmap),
    Heap(Vec<u8>),
}

impl WindowBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            WindowBytes::Mapped(map) => map,
            WindowBytes::Heap(bytes) => bytes,
        }
    }
}

impl Window {
    /// First file offset covered by this window.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last file offset covered.
    pub fn end(&self) -> u64 {
        self.start + self.bytes.as_slice().len() as u64
    }

    /// Whether `offset` falls inside this window.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// The window bytes from file offset `pos` to the window end.
    pub fn slice_from(&self, pos: u64) -> &[u8] {
        &self.bytes.as_slice()[(pos - self.start) as usize..]
    }

    /// Copy bytes starting at file offset `pos` into `dst`.
    ///
    /// # Returns
    ///
    /// The number of bytes copied, bounded by the window end.
    pub fn copy(&self, pos: u64, dst: &mut [u8]) -> usize {
        let available = self.slice_from(pos);
        let n = available.len().min(dst.len());
        dst[..n].copy_from_slice(&available[..n]);
        n
    }
}

/// Shared LRU cache of pack file windows.
///
/// One cache serves every pack of an object database (and its alternates).
/// The internal mutex is held only for map bookkeeping, never across file
/// I/O: a miss releases the lock, reads the window, and reinserts.
#[derive(Debug)]
pub struct WindowCache {
    options: WindowCacheOptions,
    state: Mutex<CacheState>,
    tick: AtomicU64,
}

#[derive(Debug, Default)]
struct CacheState {
    windows: HashMap<(u64, u64), Arc<Window>>,
    total_bytes: usize,
}

impl WindowCache {
    pub fn new(options: WindowCacheOptions) -> Self {
        WindowCache {
            options,
            state: Mutex::new(CacheState::default()),
            tick: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &WindowCacheOptions {
        &self.options
    }

    /// Fetch the window covering `offset` of the pack identified by
    /// `cache_id`, reading through `file` on a miss.
    ///
    /// The returned window's start is ≤ `offset`. Holding the `Arc` pins
    /// the window against eviction.
    pub fn get_window(
        &self,
        file: &File,
        cache_id: u64,
        file_length: u64,
        offset: u64,
    ) -> io::Result<Arc<Window>> {
        if offset >= file_length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("offset {offset} past end of pack ({file_length} bytes)"),
            ));
        }

        let stride = self.options.window_size as u64;
        let start = offset & !(stride - 1);
        let key = (cache_id, start);
        let now = self.tick.fetch_add(1, Ordering::Relaxed);

        if let Some(window) = self.state.lock().unwrap().windows.get(&key) {
            window.last_used.store(now, Ordering::Relaxed);
            return Ok(Arc::clone(window));
        }

        // Miss: do the I/O outside the lock, then reinsert. A racing
        // thread may have loaded the same window meanwhile; keep theirs.
        let length = (file_length - start).min(stride) as usize;
        let bytes = self.read_window(file, start, length)?;
        let window = Arc::new(Window {
            start,
            bytes,
            last_used: AtomicU64::new(now),
        });

        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.windows.get(&key) {
            existing.last_used.store(now, Ordering::Relaxed);
            return Ok(Arc::clone(existing));
        }
        state.total_bytes += length;
        state.windows.insert(key, Arc::clone(&window));
        self.evict_locked(&mut state);
        Ok(window)
    }

    /// Drop every cached window of one pack, e.g. after the pack file is
    /// replaced by a repack. Pinned windows stay alive for their readers.
    pub fn purge(&self, cache_id: u64) {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<_> = state
            .windows
            .keys()
            .filter(|(id, _)| *id == cache_id)
            .copied()
            .collect();
        for key in keys {
            if let Some(window) = state.windows.remove(&key) {
                state.total_bytes -= window.bytes.as_slice().len();
            }
        }
    }

    /// Current number of resident windows.
    pub fn resident_windows(&self) -> usize {
        self.state.lock().unwrap().windows.len()
    }

    fn read_window(&self, file: &File, start: u64, length: usize) -> io::Result<WindowBytes> {
        if self.options.mmap {
            let map = unsafe {
                memmap2::MmapOptions::new()
                    .offset(start)
                    .len(length)
                    .map(file)?
            };
            Ok(WindowBytes::Mapped(map))
        } else {
            let mut buffer = vec![0u8; length];
            file.read_exact_at(&mut buffer, start)?;
            Ok(WindowBytes::Heap(buffer))
        }
    }

    fn evict_locked(&self, state: &mut CacheState) {
        while state.total_bytes > self.options.window_limit {
            // LRU among unpinned windows; a pinned window has a reader
            // holding a second Arc.
            let victim = state
                .windows
                .iter()
                .filter(|(_, window)| Arc::strong_count(window) == 1)
                .min_by_key(|(_, window)| window.last_used.load(Ordering::Relaxed))
                .map(|(key, _)| *key);

            match victim {
                Some(key) => {
                    if let Some(window) = state.windows.remove(&key) {
                        state.total_bytes -= window.bytes.as_slice().len();
                        trace!(pack = key.0, start = key.1, "evicted pack window");
                    }
                }
                None => break,
            }
        }
    }
}
