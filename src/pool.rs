//! Reusable object pool with guard-based checkout.
//!
//! Checkout returns a [`PoolGuard`] rather than a raw handle: the object is
//! returned to the pool exactly once, when the guard drops, on every exit
//! path. The transaction engine recycles packet scratch buffers this way so
//! multi-packet sends do not reallocate per packet.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

/// A pool of reusable objects.
///
/// `take` pops a recycled object or falls back to `T::default()`. The pool
/// holds at most `capacity` idle objects; surplus returns are dropped.
#[derive(Debug)]
pub struct Pool<T> {
    shelf: Arc<Mutex<Vec<T>>>,
    capacity: usize,
}

impl<T: Default> Pool<T> {
    /// Create a pool that retains up to `capacity` idle objects.
    pub fn new(capacity: usize) -> Self {
        Self {
            shelf: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    /// Check out an object, recycling an idle one when available.
    pub fn take(&self) -> PoolGuard<T> {
        let value = lock(&self.shelf).pop().unwrap_or_default();
        PoolGuard {
            value: Some(value),
            shelf: Arc::clone(&self.shelf),
            capacity: self.capacity,
        }
    }

    /// Number of idle objects currently shelved.
    pub fn idle(&self) -> usize {
        lock(&self.shelf).len()
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shelf: Arc::clone(&self.shelf),
            capacity: self.capacity,
        }
    }
}

/// Checked-out pool object; returns to the pool on drop.
#[derive(Debug)]
pub struct PoolGuard<T> {
    value: Option<T>,
    shelf: Arc<Mutex<Vec<T>>>,
    capacity: usize,
}

impl<T> PoolGuard<T> {
    /// Take the object out permanently; it will not return to the pool.
    pub fn detach(mut self) -> T {
        self.value.take().expect("pool guard already detached")
    }
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pool guard already detached")
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pool guard already detached")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let mut shelf = lock(&self.shelf);
            if shelf.len() < self.capacity {
                shelf.push(value);
            }
        }
    }
}

fn lock<T>(shelf: &Mutex<Vec<T>>) -> MutexGuard<'_, Vec<T>> {
    match shelf.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_take_from_empty_pool_creates_default() {
        let pool: Pool<Vec<u8>> = Pool::new(4);
        let guard = pool.take();
        assert!(guard.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_guard_returns_on_drop() {
        let pool: Pool<Vec<u8>> = Pool::new(4);
        {
            let mut guard = pool.take();
            guard.push(7);
        }
        assert_eq!(pool.idle(), 1);

        // Recycled object keeps its state; callers clear as needed.
        let guard = pool.take();
        assert_eq!(&guard[..], &[7]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_capacity_bounds_shelf() {
        let pool: Pool<Vec<u8>> = Pool::new(1);
        let a = pool.take();
        let b = pool.take();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_detach_skips_return() {
        let pool: Pool<Vec<u8>> = Pool::new(4);
        let guard = pool.take();
        let _owned = guard.detach();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_scratch_buffer_reuse() {
        let pool: Pool<BytesMut> = Pool::new(2);
        {
            let mut buf = pool.take();
            buf.extend_from_slice(b"scratch");
            let frozen = buf.split().freeze();
            assert_eq!(&frozen[..], b"scratch");
        }
        assert_eq!(pool.idle(), 1);
        let buf = pool.take();
        assert!(buf.is_empty());
    }
}
