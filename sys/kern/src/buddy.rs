// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power-of-two ("buddy") block allocator.
//!
//! A pool manages a run of maximal blocks carved out of one region. Each block
//! begins with a `Header` recording its order; the caller's memory follows the
//! header. Free blocks additionally carry the links of a doubly-linked free
//! list, one list per order, so a free buddy can be unlinked without walking
//! its list.
//!
//! Blocks are aligned to their own size relative to an address space where the
//! pool's base is aligned to the maximal block size, so the buddy of the block
//! at `a` with order `k` is at `a ^ (1 << k)`. Two free buddies never coexist:
//! `free` merges them as it goes.
//!
//! The pool does no locking of its own. Callers serialize access, normally with
//! the guard lock in `crate::heap::Heap`.

use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::fail::die;
use crate::umem::Region;

/// Range of block orders (log2 of block size in bytes) a pool hands out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Orders {
    pub min: u32,
    pub max: u32,
}

/// Bytes at the start of every block reserved for bookkeeping.
pub const HEADER_SIZE: usize = 8;

const MAGIC: u16 = 0xBEEF;
const STATE_FREE: u8 = 0xF7;
const STATE_USED: u8 = 0xA5;

/// One free list per possible order, indexed by order.
const ORDER_SLOTS: usize = usize::BITS as usize;

#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct Header {
    magic: u16,
    order: u8,
    state: u8,
    _reserved: u32,
}

impl Header {
    const SCRUBBED: Self = Self {
        magic: 0,
        order: 0,
        state: 0,
        _reserved: 0,
    };

    fn new(order: u32, state: u8) -> Self {
        Self {
            magic: MAGIC,
            order: order as u8,
            state,
            _reserved: 0,
        }
    }
}

const_assert!(size_of::<Header>() == HEADER_SIZE);

#[repr(C)]
struct FreeBlock {
    header: Header,
    prev: Option<NonNull<FreeBlock>>,
    next: Option<NonNull<FreeBlock>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolError {
    /// `min > max`, or the minimal block can't hold a free-list node, or the
    /// maximal block doesn't fit the address space.
    BadOrders,
    /// The region doesn't contain a single aligned maximal block.
    TooSmall,
}

pub struct BuddyPool {
    region: Region,
    orders: Orders,
    free: [Option<NonNull<FreeBlock>>; ORDER_SLOTS],
    free_bytes: usize,
    outstanding: usize,
}

// Safety: the pool has exclusive use of its region, and every pointer in the
// free lists points into that region, so moving the pool between contexts
// moves the whole structure.
unsafe impl Send for BuddyPool {}

impl BuddyPool {
    /// Builds a pool over the largest run of maximal blocks, aligned to their
    /// own size, that fits inside `region`. Any slop at either end is unused.
    ///
    /// # Safety
    ///
    /// `region` must be real, writable memory that nothing else touches for as
    /// long as the pool, or any block allocated from it, exists.
    pub unsafe fn new(region: Region, orders: Orders) -> Result<Self, PoolError> {
        if orders.min > orders.max
            || orders.max as usize >= ORDER_SLOTS - 1
            || (1usize << orders.min) < size_of::<FreeBlock>()
        {
            return Err(PoolError::BadOrders);
        }

        let block = 1usize << orders.max;
        let start = region
            .base()
            .checked_next_multiple_of(block)
            .ok_or(PoolError::TooSmall)?;
        let count = region.end().saturating_sub(start) / block;
        if count == 0 {
            return Err(PoolError::TooSmall);
        }
        let span = Region::from_raw(start, count * block)
            .map_err(|_| PoolError::TooSmall)?;

        let mut pool = Self {
            region: span,
            orders,
            free: [None; ORDER_SLOTS],
            free_bytes: span.size(),
            outstanding: 0,
        };
        // Pushed in reverse so the list reads in address order.
        for i in (0..count).rev() {
            pool.push(start + i * block, orders.max);
        }
        Ok(pool)
    }

    /// Smallest order whose block fits `size` bytes plus the header, or `None`
    /// if that's beyond the largest block.
    pub fn order_for(&self, size: usize) -> Option<u32> {
        let need = size.checked_add(HEADER_SIZE)?;
        let order = need
            .checked_next_power_of_two()?
            .trailing_zeros()
            .max(self.orders.min);
        (order <= self.orders.max).then_some(order)
    }

    /// Hands out a block able to hold `size` bytes, or `None` if there's no
    /// free block big enough anywhere in the pool.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let want = self.order_for(size)?;
        let have = (want..=self.orders.max)
            .find(|&order| self.free[order as usize].is_some())?;
        let block = self.pop(have)?;

        // Split down to size, keeping the lower half each time and freeing the
        // upper.
        let mut order = have;
        while order > want {
            order -= 1;
            self.push(block + (1 << order), order);
        }

        // Safety: `block` is the start of a block of order `want` that we just
        // took off the free lists, so it's ours and big enough for a header.
        unsafe {
            (block as *mut Header).write(Header::new(want, STATE_USED));
        }
        self.free_bytes -= 1 << want;
        self.outstanding += 1;
        NonNull::new((block + HEADER_SIZE) as *mut u8)
    }

    /// Returns a block to the pool, merging it with its buddy for as long as
    /// the buddy is free.
    ///
    /// Freeing a pointer this pool didn't hand out, or freeing a block twice,
    /// halts the system: the pool's structure can no longer be trusted.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = (ptr.as_ptr() as usize).wrapping_sub(HEADER_SIZE);
        let Some(order) = self.used_order(addr) else {
            die(format_args!(
                "free of {:#x}: not a live block of this pool",
                ptr.as_ptr() as usize
            ));
        };

        self.free_bytes += 1 << order;
        self.outstanding -= 1;

        let base = self.region.base();
        let mut block = addr;
        let mut order = order;
        while order < self.orders.max {
            let buddy = base + ((block - base) ^ (1 << order));
            // Safety: below max order, a block's buddy lies in the same maximal
            // block, so it's inside our region and starts a block of its own
            // (possibly split further, in which case its header has a smaller
            // order).
            let h = unsafe { self.header_at(buddy) };
            if h.magic != MAGIC
                || h.state != STATE_FREE
                || u32::from(h.order) != order
            {
                break;
            }
            // Safety: the header says `buddy` is a free block of this order,
            // which means it's on that free list.
            unsafe {
                self.unlink(NonNull::new_unchecked(buddy as *mut FreeBlock), order);
            }
            let upper = block.max(buddy);
            // Safety: `upper` is now interior to the merged block, which we own.
            unsafe {
                (upper as *mut Header).write(Header::SCRUBBED);
            }
            block = block.min(buddy);
            order += 1;
        }
        self.push(block, order);
    }

    /// Order of the live block holding `ptr`, or `None` if `ptr` isn't one this
    /// pool handed out (or it has since been freed).
    pub fn block_order(&self, ptr: NonNull<u8>) -> Option<u32> {
        self.used_order((ptr.as_ptr() as usize).wrapping_sub(HEADER_SIZE))
    }

    /// Bytes in free blocks, headers included.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Blocks handed out and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Number of blocks on the free list for `order`.
    pub fn free_blocks(&self, order: u32) -> usize {
        let mut n = 0;
        let mut cursor = self.free.get(order as usize).copied().flatten();
        while let Some(node) = cursor {
            n += 1;
            // Safety: free-list nodes are free blocks inside our region.
            cursor = unsafe { (*node.as_ptr()).next };
        }
        n
    }

    /// Span of memory actually managed.
    pub fn region(&self) -> Region {
        self.region
    }

    pub fn orders(&self) -> Orders {
        self.orders
    }

    fn used_order(&self, addr: usize) -> Option<u32> {
        let min_block = 1usize << self.orders.min;
        if !self.region.contains(addr)
            || (addr - self.region.base()) % min_block != 0
        {
            return None;
        }
        // Safety: `addr` is a min-block boundary inside our region; every such
        // boundary is readable, and the header check below tells us whether a
        // block actually starts there.
        let h = unsafe { self.header_at(addr) };
        let order = u32::from(h.order);
        let aligned = (addr - self.region.base()) % (1usize << order) == 0;
        (h.magic == MAGIC
            && h.state == STATE_USED
            && order >= self.orders.min
            && order <= self.orders.max
            && aligned)
            .then_some(order)
    }

    /// # Safety
    ///
    /// `addr` must be a min-block boundary inside the region.
    unsafe fn header_at(&self, addr: usize) -> Header {
        unsafe { (addr as *const Header).read() }
    }

    fn push(&mut self, addr: usize, order: u32) {
        let node = addr as *mut FreeBlock;
        let head = self.free[order as usize];
        // Safety: `addr` starts a block of `order` inside our region, which we
        // own; min order is big enough for a `FreeBlock`, and block alignment
        // is at least its alignment.
        unsafe {
            node.write(FreeBlock {
                header: Header::new(order, STATE_FREE),
                prev: None,
                next: head,
            });
            if let Some(h) = head {
                (*h.as_ptr()).prev = NonNull::new(node);
            }
        }
        self.free[order as usize] = NonNull::new(node);
    }

    fn pop(&mut self, order: u32) -> Option<usize> {
        let head = self.free[order as usize]?;
        // Safety: `head` came off the list for `order`.
        unsafe {
            self.unlink(head, order);
        }
        Some(head.as_ptr() as usize)
    }

    /// # Safety
    ///
    /// `node` must be on the free list for `order`.
    unsafe fn unlink(&mut self, node: NonNull<FreeBlock>, order: u32) {
        let n = node.as_ptr();
        unsafe {
            let (prev, next) = ((*n).prev, (*n).next);
            match prev {
                Some(p) => (*p.as_ptr()).next = next,
                None => self.free[order as usize] = next,
            }
            if let Some(nx) = next {
                (*nx.as_ptr()).prev = prev;
            }
            (*n).header.state = STATE_USED;
        }
    }
}

/// Heap-backed memory for exercising pools (and the things built on them) in
/// host tests.
#[cfg(test)]
pub(crate) mod test_memory {
    use super::*;

    pub struct TestMemory {
        _backing: Vec<u8>,
        region: Region,
    }

    impl TestMemory {
        /// Memory of `1 << order` bytes, aligned to its own size.
        pub fn aligned(order: u32) -> Self {
            let size = 1usize << order;
            let mut backing = vec![0u8; size * 2];
            let base = (backing.as_mut_ptr() as usize).next_multiple_of(size);
            Self {
                _backing: backing,
                region: Region::from_raw(base, size).unwrap(),
            }
        }

        pub fn region(&self) -> Region {
            self.region
        }

        pub fn pool(&self, orders: Orders) -> BuddyPool {
            // Safety: the backing vector outlives every pool in the tests
            // that use it, and nothing else writes to it.
            unsafe { BuddyPool::new(self.region, orders).unwrap() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_memory::TestMemory;
    use super::*;
    use proptest::prelude::*;

    const ORDERS: Orders = Orders { min: 5, max: 12 };

    fn block_of(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize - HEADER_SIZE
    }

    #[test]
    fn fresh_pool_is_one_maximal_block() {
        let mem = TestMemory::aligned(12);
        let pool = mem.pool(ORDERS);
        assert_eq!(pool.free_blocks(12), 1);
        assert_eq!(pool.free_bytes(), 4096);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn request_rounds_up_to_header_inclusive_power_of_two() {
        let mem = TestMemory::aligned(12);
        let mut pool = mem.pool(ORDERS);
        // 1 byte + header fits in the minimum block.
        assert_eq!(pool.order_for(1), Some(5));
        // 24 + 8 = 32, exactly the minimum block.
        assert_eq!(pool.order_for(24), Some(5));
        assert_eq!(pool.order_for(25), Some(6));
        assert_eq!(pool.order_for(4096 - HEADER_SIZE), Some(12));
        assert_eq!(pool.order_for(4096 - HEADER_SIZE + 1), None);

        let p = pool.allocate(100).unwrap();
        assert_eq!(pool.block_order(p), Some(7));
    }

    #[test]
    fn split_leaves_one_free_block_per_intermediate_order() {
        let mem = TestMemory::aligned(12);
        let mut pool = mem.pool(ORDERS);
        let p = pool.allocate(1).unwrap();
        assert_eq!(block_of(p), mem.region().base());
        for order in 5..12 {
            assert_eq!(pool.free_blocks(order), 1, "order {order}");
        }
        assert_eq!(pool.free_blocks(12), 0);
        assert_eq!(pool.free_bytes(), 4096 - 32);
    }

    #[test]
    fn blocks_are_aligned_to_their_size() {
        let mem = TestMemory::aligned(12);
        let mut pool = mem.pool(ORDERS);
        let small = pool.allocate(1).unwrap();
        let big = pool.allocate(1000).unwrap();
        assert_eq!(block_of(small) % 32, 0);
        assert_eq!(pool.block_order(big), Some(10));
        assert_eq!(block_of(big) % 1024, 0);
    }

    #[test]
    fn free_coalesces_back_to_one_block() {
        let mem = TestMemory::aligned(12);
        let mut pool = mem.pool(ORDERS);
        let a = pool.allocate(10).unwrap();
        let b = pool.allocate(10).unwrap();
        let c = pool.allocate(300).unwrap();
        pool.free(b);
        pool.free(a);
        pool.free(c);
        assert_eq!(pool.free_blocks(12), 1);
        for order in 5..12 {
            assert_eq!(pool.free_blocks(order), 0);
        }
        assert_eq!(pool.free_bytes(), 4096);
    }

    #[test]
    fn exhaustion_fails_cleanly() {
        let mem = TestMemory::aligned(12);
        let mut pool = mem.pool(ORDERS);
        let whole = pool.allocate(4000).unwrap();
        assert!(pool.allocate(1).is_none());
        pool.free(whole);
        assert!(pool.allocate(1).is_some());
    }

    #[test]
    fn misaligned_region_uses_aligned_interior() {
        let mem = TestMemory::aligned(13);
        let r = mem.region();
        let off = Region::from_raw(r.base() + 64, r.size() - 64).unwrap();
        let pool = unsafe { BuddyPool::new(off, ORDERS).unwrap() };
        // The first maximal block is lost to the misalignment.
        assert_eq!(pool.region().base(), r.base() + 4096);
        assert_eq!(pool.free_blocks(12), 1);
    }

    #[test]
    fn too_small_and_bad_orders_rejected() {
        let mem = TestMemory::aligned(11);
        assert_eq!(
            unsafe { BuddyPool::new(mem.region(), ORDERS) }.err(),
            Some(PoolError::TooSmall)
        );
        let inverted = Orders { min: 9, max: 8 };
        assert_eq!(
            unsafe { BuddyPool::new(mem.region(), inverted) }.err(),
            Some(PoolError::BadOrders)
        );
        let tiny = Orders { min: 2, max: 8 };
        assert_eq!(
            unsafe { BuddyPool::new(mem.region(), tiny) }.err(),
            Some(PoolError::BadOrders)
        );
    }

    #[test]
    #[should_panic(expected = "not a live block")]
    fn double_free_is_fatal() {
        let mem = TestMemory::aligned(12);
        let mut pool = mem.pool(ORDERS);
        let a = pool.allocate(10).unwrap();
        let _b = pool.allocate(10).unwrap();
        pool.free(a);
        pool.free(a);
    }

    #[test]
    #[should_panic(expected = "not a live block")]
    fn foreign_pointer_is_fatal() {
        let mem = TestMemory::aligned(12);
        let mut pool = mem.pool(ORDERS);
        let mut outside = 0u64;
        pool.free(NonNull::from(&mut outside).cast());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Alloc(usize),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..1500).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn random_traffic_keeps_blocks_disjoint(ops in prop::collection::vec(op(), 1..200)) {
            let mem = TestMemory::aligned(14);
            let mut pool = mem.pool(Orders { min: 5, max: 13 });
            let mut live: Vec<(NonNull<u8>, usize, u8)> = vec![];
            let mut tag = 0u8;

            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        let Some(p) = pool.allocate(size) else {
                            continue;
                        };
                        let order = pool.block_order(p).unwrap();
                        prop_assert_eq!(Some(order), pool.order_for(size));
                        let start = block_of(p);
                        let end = start + (1 << order);
                        prop_assert_eq!(start % (1 << order), 0);
                        for &(q, _, _) in &live {
                            let qs = block_of(q);
                            let qe = qs + (1 << pool.block_order(q).unwrap());
                            prop_assert!(end <= qs || qe <= start);
                        }
                        tag = tag.wrapping_add(1);
                        unsafe { core::ptr::write_bytes(p.as_ptr(), tag, size) };
                        live.push((p, size, tag));
                    }
                    Op::Free(i) => {
                        if live.is_empty() {
                            continue;
                        }
                        let (p, size, tag) = live.swap_remove(i % live.len());
                        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
                        prop_assert!(bytes.iter().all(|&b| b == tag));
                        pool.free(p);
                    }
                }
            }

            for (p, _, _) in live.drain(..) {
                pool.free(p);
            }
            prop_assert_eq!(pool.outstanding(), 0);
            prop_assert_eq!(pool.free_blocks(13), 2);
            prop_assert_eq!(pool.free_bytes(), 1 << 14);
            for order in 5..13 {
                prop_assert_eq!(pool.free_blocks(order), 0);
            }
        }
    }
}
