//! Packet identifier pool
//!
//! One pool per connection per direction. Identifiers are 16-bit and
//! non-zero; an id stays in use from allocation (or reservation) until it is
//! released.

use std::fmt;

const WORDS: usize = 65536 / 64;

/// Usable identifiers (0 is reserved)
pub const MAX_PACKET_IDS: usize = 65535;

/// Every identifier of the pool is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted;

impl fmt::Display for PoolExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packet identifier pool exhausted")
    }
}

impl std::error::Error for PoolExhausted {}

/// Bitmap-backed packet identifier pool
///
/// Allocation is monotonically increasing with wraparound, skipping ids
/// still in use.
pub struct PacketIdPool {
    bits: Box<[u64; WORDS]>,
    in_use: usize,
    next: u16,
}

impl PacketIdPool {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0; WORDS]),
            in_use: 0,
            next: 1,
        }
    }

    #[inline]
    fn slot(id: u16) -> (usize, u64) {
        (id as usize / 64, 1u64 << (id % 64))
    }

    #[inline]
    fn set(&mut self, id: u16) {
        let (word, mask) = Self::slot(id);
        self.bits[word] |= mask;
        self.in_use += 1;
    }

    #[inline]
    fn advance(&mut self) {
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
    }

    /// Allocate the next free identifier
    pub fn allocate(&mut self) -> Result<u16, PoolExhausted> {
        if self.in_use >= MAX_PACKET_IDS {
            return Err(PoolExhausted);
        }

        // At least one id is free, so this terminates within one lap
        loop {
            let id = self.next;
            self.advance();
            if !self.is_in_use(id) {
                self.set(id);
                return Ok(id);
            }
        }
    }

    /// Mark a peer-chosen identifier as in use
    ///
    /// Returns false when the id is 0 or already in use.
    pub fn reserve(&mut self, id: u16) -> bool {
        if id == 0 || self.is_in_use(id) {
            return false;
        }
        self.set(id);
        true
    }

    /// Return an identifier to the free set
    ///
    /// Releasing an id that isn't in use is a no-op; returns whether it was.
    pub fn release(&mut self, id: u16) -> bool {
        if !self.is_in_use(id) {
            return false;
        }
        let (word, mask) = Self::slot(id);
        self.bits[word] &= !mask;
        self.in_use -= 1;
        true
    }

    /// Check if an identifier is currently in use
    pub fn is_in_use(&self, id: u16) -> bool {
        let (word, mask) = Self::slot(id);
        id != 0 && self.bits[word] & mask != 0
    }

    /// Number of identifiers currently in use
    pub fn in_use_count(&self) -> usize {
        self.in_use
    }

    /// Release every identifier
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.in_use = 0;
        self.next = 1;
    }
}

impl Default for PacketIdPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketIdPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketIdPool")
            .field("in_use", &self.in_use)
            .field("next", &self.next)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut pool = PacketIdPool::new();
        assert_eq!(pool.allocate(), Ok(1));
        assert_eq!(pool.allocate(), Ok(2));
        assert_eq!(pool.allocate(), Ok(3));
        assert_eq!(pool.in_use_count(), 3);
    }

    #[test]
    fn test_released_id_is_not_reused_early() {
        let mut pool = PacketIdPool::new();
        let first = pool.allocate().unwrap();
        assert!(pool.release(first));
        assert!(!pool.is_in_use(first));

        // Monotonic policy moves on instead of handing back the same id
        assert_eq!(pool.allocate(), Ok(first + 1));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = PacketIdPool::new();
        let id = pool.allocate().unwrap();
        assert!(pool.release(id));
        assert!(!pool.release(id));
        assert!(!pool.release(4242));
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn test_wraparound_skips_zero_and_in_use() {
        let mut pool = PacketIdPool::new();
        pool.next = 65534;
        assert!(pool.reserve(1));

        assert_eq!(pool.allocate(), Ok(65534));
        assert_eq!(pool.allocate(), Ok(65535));
        // 0 is skipped, 1 is reserved
        assert_eq!(pool.allocate(), Ok(2));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = PacketIdPool::new();
        for _ in 0..MAX_PACKET_IDS {
            pool.allocate().unwrap();
        }
        assert_eq!(pool.allocate(), Err(PoolExhausted));

        assert!(pool.release(777));
        assert_eq!(pool.allocate(), Ok(777));
        assert_eq!(pool.allocate(), Err(PoolExhausted));
    }

    #[test]
    fn test_reserve() {
        let mut pool = PacketIdPool::new();
        assert!(!pool.reserve(0));
        assert!(pool.reserve(10));
        assert!(!pool.reserve(10));
        assert!(pool.is_in_use(10));

        pool.clear();
        assert!(!pool.is_in_use(10));
        assert_eq!(pool.in_use_count(), 0);
    }
}
