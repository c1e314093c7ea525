//! # Sample Buffer Pool
//!
//! Reusable arena for audio sample buffers. Synthesis produces one buffer per
//! chunk and chapter assembly needs one large buffer per chapter; pooling them
//! avoids repeated large allocations across chapters.
//!
//! Buffers are keyed by element type and a power-of-two size bucket
//! (`floor(log2(bytes))`). A request reuses the smallest free buffer in its
//! bucket that is large enough, otherwise it allocates. Dropping a
//! [`PooledBuffer`] returns it to the pool unless that would push the pool
//! past its byte cap, in which case the memory is freed.
//!
//! ```
//! use core_memory::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(64 * 1024 * 1024);
//! {
//!     let mut samples = pool.acquire::<f32>(&[24_000]).unwrap();
//!     samples[0] = 0.5;
//! } // returned to the pool here
//!
//! let again = pool.acquire::<f32>(&[24_000]).unwrap();
//! assert_eq!(again[0], 0.0);
//! assert_eq!(pool.stats().reused, 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{MemoryError, Result};

/// Element type of a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    F64,
    I16,
    I32,
}

impl ElementType {
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F64 => 8,
            ElementType::I16 => 2,
        }
    }
}

/// Type-erased storage held by the pool between uses.
enum SampleStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I16(Vec<i16>),
    I32(Vec<i32>),
}

impl SampleStorage {
    fn element(&self) -> ElementType {
        match self {
            SampleStorage::F32(_) => ElementType::F32,
            SampleStorage::F64(_) => ElementType::F64,
            SampleStorage::I16(_) => ElementType::I16,
            SampleStorage::I32(_) => ElementType::I32,
        }
    }

    fn capacity(&self) -> usize {
        match self {
            SampleStorage::F32(v) => v.capacity(),
            SampleStorage::F64(v) => v.capacity(),
            SampleStorage::I16(v) => v.capacity(),
            SampleStorage::I32(v) => v.capacity(),
        }
    }

    fn size_bytes(&self) -> usize {
        self.capacity() * self.element().size_bytes()
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for i16 {}
    impl Sealed for i32 {}
}

/// Sample types the pool can hold.
pub trait Sample: Copy + Default + Send + Sync + 'static + sealed::Sealed {
    #[doc(hidden)]
    const ELEMENT: ElementType;
    #[doc(hidden)]
    fn wrap(buffer: Vec<Self>) -> SampleStorageHandle;
    #[doc(hidden)]
    fn unwrap(storage: SampleStorageHandle) -> Option<Vec<Self>>;
}

/// Opaque wrapper so [`Sample`] can name the private storage enum.
#[doc(hidden)]
pub struct SampleStorageHandle(SampleStorage);

macro_rules! impl_sample {
    ($ty:ty, $variant:ident) => {
        impl Sample for $ty {
            const ELEMENT: ElementType = ElementType::$variant;

            fn wrap(buffer: Vec<Self>) -> SampleStorageHandle {
                SampleStorageHandle(SampleStorage::$variant(buffer))
            }

            fn unwrap(storage: SampleStorageHandle) -> Option<Vec<Self>> {
                match storage.0 {
                    SampleStorage::$variant(buffer) => Some(buffer),
                    _ => None,
                }
            }
        }
    };
}

impl_sample!(f32, F32);
impl_sample!(f64, F64);
impl_sample!(i16, I16);
impl_sample!(i32, I32);

type BucketKey = (ElementType, u32);

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Fresh allocations.
    pub allocated: u64,
    /// Acquisitions served from the pool.
    pub reused: u64,
    /// Buffers accepted back into the pool.
    pub released: u64,
    /// Buffers freed on return because the pool was at its cap.
    pub discarded: u64,
    /// Buffers currently held by the pool.
    pub current_pooled: usize,
    pub peak_pooled: usize,
    /// Bytes currently held by the pool.
    pub pooled_bytes: u64,
}

impl BufferPoolStats {
    /// Fraction of acquisitions served from the pool.
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.allocated + self.reused;
        if total == 0 {
            0.0
        } else {
            self.reused as f64 / total as f64
        }
    }
}

struct PoolState {
    buckets: HashMap<BucketKey, Vec<SampleStorage>>,
    stats: BufferPoolStats,
    outstanding: usize,
}

struct PoolInner {
    max_bytes: u64,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn give_back(&self, storage: SampleStorage) {
        let size = storage.size_bytes() as u64;
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);

        if size == 0 || state.stats.pooled_bytes + size > self.max_bytes {
            state.stats.discarded += 1;
            trace!(bytes = size, "Buffer discarded at pool cap");
            return;
        }

        let key = (storage.element(), bucket_for(size));
        state.buckets.entry(key).or_default().push(storage);
        state.stats.released += 1;
        state.stats.pooled_bytes += size;
        state.stats.current_pooled += 1;
        state.stats.peak_pooled = state.stats.peak_pooled.max(state.stats.current_pooled);
    }

    fn detach(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }
}

fn bucket_for(bytes: u64) -> u32 {
    if bytes == 0 {
        0
    } else {
        63 - bytes.leading_zeros()
    }
}

/// Thread-safe pool of typed sample buffers.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool that retains at most `max_bytes` of idle buffers.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_bytes,
                state: Mutex::new(PoolState {
                    buckets: HashMap::new(),
                    stats: BufferPoolStats::default(),
                    outstanding: 0,
                }),
            }),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes
    }

    /// Acquires a zero-filled buffer with `shape`'s element count.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidShape`] if the shape has no elements or its size
    /// overflows.
    pub fn acquire<T: Sample>(&self, shape: &[usize]) -> Result<PooledBuffer<T>> {
        let len = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| MemoryError::InvalidShape {
                shape: shape.to_vec(),
                reason: "element count overflows".to_string(),
            })?;

        if shape.is_empty() || len == 0 {
            return Err(MemoryError::InvalidShape {
                shape: shape.to_vec(),
                reason: "buffer must hold at least one element".to_string(),
            });
        }

        let bytes = len
            .checked_mul(T::ELEMENT.size_bytes())
            .ok_or_else(|| MemoryError::InvalidShape {
                shape: shape.to_vec(),
                reason: "byte size overflows".to_string(),
            })? as u64;
        let key = (T::ELEMENT, bucket_for(bytes));

        let reused = {
            let mut state = self.inner.state.lock();
            state.outstanding += 1;

            let candidate = state.buckets.get_mut(&key).and_then(|free| {
                let position = free
                    .iter()
                    .enumerate()
                    .filter(|(_, storage)| storage.capacity() >= len)
                    .min_by_key(|(_, storage)| storage.capacity())
                    .map(|(position, _)| position)?;
                Some(free.swap_remove(position))
            });

            match candidate {
                Some(storage) => {
                    state.stats.reused += 1;
                    state.stats.current_pooled -= 1;
                    state.stats.pooled_bytes -= storage.size_bytes() as u64;
                    Some(storage)
                }
                None => {
                    state.stats.allocated += 1;
                    None
                }
            }
        };

        let data = match reused.and_then(|storage| T::unwrap(SampleStorageHandle(storage))) {
            Some(mut buffer) => {
                buffer.clear();
                buffer.resize(len, T::default());
                buffer
            }
            None => {
                trace!(bytes, bucket = key.1, "Allocating sample buffer");
                vec![T::default(); len]
            }
        };

        Ok(PooledBuffer {
            data: Some(data),
            shape: shape.to_vec(),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Returns a buffer to the pool. Equivalent to dropping it.
    pub fn release<T: Sample>(&self, buffer: PooledBuffer<T>) {
        drop(buffer);
    }

    /// Frees every idle buffer.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let freed = state.stats.pooled_bytes;
        state.buckets.clear();
        state.stats.current_pooled = 0;
        state.stats.pooled_bytes = 0;
        debug!(freed_bytes = freed, "Buffer pool cleared");
    }

    /// Bytes currently held idle by the pool.
    pub fn pool_size_bytes(&self) -> u64 {
        self.inner.state.lock().stats.pooled_bytes
    }

    /// Buffers handed out and not yet returned or detached.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.inner.state.lock().stats
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BufferPool")
            .field("max_bytes", &self.inner.max_bytes)
            .field("stats", &state.stats)
            .field("outstanding", &state.outstanding)
            .finish()
    }
}

/// A sample buffer on loan from a [`BufferPool`].
///
/// Dereferences to `[T]`. Returned to the pool on drop.
pub struct PooledBuffer<T: Sample> {
    data: Option<Vec<T>>,
    shape: Vec<usize>,
    pool: Arc<PoolInner>,
}

impl<T: Sample> PooledBuffer<T> {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        T::ELEMENT
    }

    /// Takes ownership of the samples; the memory never returns to the pool.
    pub fn into_vec(mut self) -> Vec<T> {
        self.pool.detach();
        self.data.take().unwrap_or_default()
    }
}

impl<T: Sample> Deref for PooledBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl<T: Sample> DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl<T: Sample> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.give_back(T::wrap(data).0);
        }
    }
}

impl<T: Sample + fmt::Debug> fmt::Debug for PooledBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("element", &T::ELEMENT)
            .field("shape", &self.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_dropped_buffer_is_reused() {
        let pool = BufferPool::new(16 * MIB);

        let first = pool.acquire::<f32>(&[1000]).unwrap();
        let first_ptr = first.as_ptr();
        drop(first);

        let second = pool.acquire::<f32>(&[900]).unwrap();
        assert_eq!(second.as_ptr(), first_ptr);
        assert_eq!(second.len(), 900);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.reuse_ratio(), 0.5);
    }

    #[test]
    fn test_reused_buffer_is_zero_filled() {
        let pool = BufferPool::new(16 * MIB);
        {
            let mut buffer = pool.acquire::<i16>(&[2, 256]).unwrap();
            buffer.iter_mut().for_each(|s| *s = 7);
        }

        let buffer = pool.acquire::<i16>(&[512]).unwrap();
        assert!(buffer.iter().all(|&s| s == 0));
        assert_eq!(buffer.shape(), &[512]);
    }

    #[test]
    fn test_live_buffers_never_alias() {
        let pool = BufferPool::new(16 * MIB);
        drop(pool.acquire::<f32>(&[4096]).unwrap());

        let a = pool.acquire::<f32>(&[4096]).unwrap();
        let b = pool.acquire::<f32>(&[4096]).unwrap();

        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_acquisition_counts_balance() {
        let pool = BufferPool::new(16 * MIB);
        let sizes = [100usize, 2000, 150, 100, 64_000, 2000, 120, 64_000];

        let mut live = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            live.push(pool.acquire::<f32>(&[size]).unwrap());
            if i % 2 == 1 {
                live.clear();
            }
        }

        let stats = pool.stats();
        assert_eq!(stats.allocated + stats.reused, sizes.len() as u64);
    }

    #[test]
    fn test_element_types_do_not_mix() {
        let pool = BufferPool::new(16 * MIB);
        drop(pool.acquire::<i32>(&[1024]).unwrap());

        // Same byte size, different element type.
        let floats = pool.acquire::<f32>(&[1024]).unwrap();
        assert_eq!(floats.element_type(), ElementType::F32);
        assert_eq!(pool.stats().reused, 0);
        assert_eq!(pool.stats().current_pooled, 1);
    }

    #[test]
    fn test_buffers_over_cap_are_discarded() {
        let pool = BufferPool::new(8 * 1024);

        let a = pool.acquire::<f32>(&[1024]).unwrap(); // 4 KiB
        let b = pool.acquire::<f32>(&[1024]).unwrap(); // 4 KiB
        let c = pool.acquire::<f32>(&[1024]).unwrap(); // 4 KiB
        drop(a);
        drop(b);
        drop(c);

        let stats = pool.stats();
        assert_eq!(stats.released, 2);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.pooled_bytes, 8 * 1024);
        assert!(pool.pool_size_bytes() <= pool.max_bytes());
    }

    #[test]
    fn test_explicit_release_and_clear() {
        let pool = BufferPool::new(16 * MIB);
        let buffer = pool.acquire::<f64>(&[10, 10]).unwrap();
        pool.release(buffer);

        assert_eq!(pool.stats().current_pooled, 1);
        assert_eq!(pool.stats().peak_pooled, 1);
        assert_eq!(pool.pool_size_bytes(), 800);

        pool.clear();
        assert_eq!(pool.pool_size_bytes(), 0);
        assert_eq!(pool.stats().current_pooled, 0);
        assert_eq!(pool.stats().peak_pooled, 1);
    }

    #[test]
    fn test_into_vec_detaches() {
        let pool = BufferPool::new(16 * MIB);
        let buffer = pool.acquire::<f32>(&[32]).unwrap();
        let samples = buffer.into_vec();

        assert_eq!(samples.len(), 32);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.stats().released, 0);
    }

    #[test]
    fn test_invalid_shapes_are_rejected() {
        let pool = BufferPool::new(MIB);

        assert!(matches!(
            pool.acquire::<f32>(&[]),
            Err(MemoryError::InvalidShape { .. })
        ));
        assert!(matches!(
            pool.acquire::<f32>(&[16, 0]),
            Err(MemoryError::InvalidShape { .. })
        ));
        assert!(matches!(
            pool.acquire::<f32>(&[usize::MAX, 2]),
            Err(MemoryError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_concurrent_use_keeps_counts_consistent() {
        let pool = BufferPool::new(64 * MIB);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for n in 1..50 {
                        let mut buffer = pool.acquire::<f32>(&[n * 64]).unwrap();
                        buffer[0] = n as f32;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.allocated + stats.reused, 4 * 49);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_bucket_for() {
        assert_eq!(bucket_for(1), 0);
        assert_eq!(bucket_for(4096), 12);
        assert_eq!(bucket_for(4097), 12);
        assert_eq!(bucket_for(8191), 12);
    }
}
