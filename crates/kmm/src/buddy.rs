//! Index-linked buddy free lists.
//!
//! The same split/merge algorithm runs at three granularities: physical frames inside a
//! zone, superpages inside a virtual region and base pages inside demoted superpages.
//! Each of them stores its per-unit state in a dense array and exposes it through
//! [`BuddyBlocks`]; [`FreeLists`] only holds one list head per order and links blocks
//! through the `next` index of their first unit. No pointers are involved, so the
//! backing arrays can live anywhere and be moved freely.
//!
//! Every unit of a block carries the block's order, which lets `free` validate a whole
//! run before accepting it and keeps buddy checks to a single lookup.

use crate::AllocError;

/// Sentinel for "no next block" and for empty lists.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Sentinel order for units that are not part of any block.
pub const INVALID_ORDER: u8 = u8::MAX;

/// Per-unit state a buddy allocator needs.
pub trait BuddyBlocks {
    /// Number of units in the arena.
    fn len(&self) -> usize;

    /// Order of the block the unit belongs to, or [`INVALID_ORDER`].
    fn order(&self, index: u32) -> u8;

    fn set_order(&mut self, index: u32, order: u8);

    /// Successor of a free block's first unit in its list.
    fn next(&self, index: u32) -> u32;

    fn set_next(&mut self, index: u32, next: u32);

    /// Whether the unit belongs to a free block.
    fn is_free(&self, index: u32) -> bool;

    fn set_free(&mut self, index: u32, free: bool);

    /// Whether two units may ever be part of the same block.
    fn same_pool(&self, a: u32, b: u32) -> bool;
}

/// One free-list head per order, `0..N`.
#[derive(Debug, Clone)]
pub struct FreeLists<const N: usize> {
    heads: [u32; N],
}

impl<const N: usize> FreeLists<N> {
    /// Largest order these lists track.
    pub const MAX_ORDER: u8 = (N - 1) as u8;

    /// Creates empty lists.
    pub const fn new() -> Self {
        Self {
            heads: [INVALID_INDEX; N],
        }
    }

    /// First block of the list at `order`.
    pub fn head(&self, order: u8) -> Option<u32> {
        match self.heads.get(order as usize) {
            Some(&head) if head != INVALID_INDEX => Some(head),
            _ => None,
        }
    }

    /// Whether every list is empty.
    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(|&head| head == INVALID_INDEX)
    }

    /// Number of blocks queued at `order`.
    pub fn count<B: BuddyBlocks + ?Sized>(&self, blocks: &B, order: u8) -> usize {
        let Some(&head) = self.heads.get(order as usize) else {
            return 0;
        };
        let mut count = 0;
        let mut cursor = head;
        while cursor != INVALID_INDEX {
            count += 1;
            cursor = blocks.next(cursor);
        }
        count
    }

    /// Number of free units across every order.
    pub fn free_units<B: BuddyBlocks + ?Sized>(&self, blocks: &B) -> usize {
        (0..N as u8)
            .map(|order| self.count(blocks, order) << order)
            .sum()
    }

    /// Allocates a block of `2^order` units and returns its first index.
    ///
    /// When the list at `order` is empty, a block of the next order is split first,
    /// recursively up to [`Self::MAX_ORDER`].
    pub fn alloc<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, order: u8) -> Result<u32, AllocError> {
        if order > Self::MAX_ORDER {
            return Err(AllocError::InvalidOrder);
        }
        self.split(blocks, order)?;
        let index = self.pop(blocks, order).ok_or(AllocError::OutOfMemory)?;
        Self::label(blocks, index, order, false);
        Ok(index)
    }

    /// Releases the block starting at `index` and merges it with free buddies.
    ///
    /// Returns the first index and order of the block the units ended up in. Fails
    /// without touching any list when `index` is not the start of a live block.
    pub fn free<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, index: u32) -> Result<(u32, u8), AllocError> {
        if index as usize >= blocks.len() {
            return Err(AllocError::InvalidAddress);
        }
        let order = blocks.order(index);
        if order > Self::MAX_ORDER {
            return Err(AllocError::InvalidAddress);
        }
        if index & ((1 << order) - 1) != 0 {
            return Err(AllocError::Misaligned);
        }
        let end = index as usize + (1usize << order);
        if end > blocks.len() {
            return Err(AllocError::InvalidAddress);
        }
        let live = (index..end as u32).all(|unit| {
            blocks.order(unit) == order && !blocks.is_free(unit) && blocks.same_pool(index, unit)
        });
        if !live {
            return Err(AllocError::InvalidAddress);
        }

        self.push(blocks, index, order);
        Ok(self.merge(blocks, index, order))
    }

    /// Adds units that were never part of the allocator as a free block, merging as usual.
    pub fn insert<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, index: u32, order: u8) -> (u32, u8) {
        debug_assert!(order <= Self::MAX_ORDER);
        debug_assert_eq!(index & ((1 << order) - 1), 0);
        self.push(blocks, index, order);
        self.merge(blocks, index, order)
    }

    /// Detaches the free block starting at `index` from its list without allocating it.
    ///
    /// The units keep their order and stay marked free; the caller takes them over.
    pub fn take<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, index: u32, order: u8) -> bool {
        self.unlink(blocks, index, order)
    }

    /// Guarantees that the list at `order` is non-empty by splitting larger blocks.
    ///
    /// The head of the list one order up is cut in half. Both halves are queued at
    /// `order`, lower half first, ahead of whatever the list already held.
    pub fn split<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, order: u8) -> Result<(), AllocError> {
        if self.heads[order as usize] != INVALID_INDEX {
            return Ok(());
        }
        if order >= Self::MAX_ORDER {
            return Err(AllocError::OutOfMemory);
        }

        self.split(blocks, order + 1)?;
        let block = self.pop(blocks, order + 1).ok_or(AllocError::OutOfMemory)?;
        let upper = block + (1 << order);
        self.push(blocks, upper, order);
        self.push(blocks, block, order);
        log::trace!("split block {} at order {}", block, order + 1);
        Ok(())
    }

    fn merge<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, index: u32, order: u8) -> (u32, u8) {
        if order >= Self::MAX_ORDER {
            return (index, order);
        }

        let size = 1u32 << order;
        let buddy = index ^ size;
        if buddy as usize + size as usize > blocks.len()
            || !blocks.is_free(buddy)
            || blocks.order(buddy) != order
            || !blocks.same_pool(index, buddy)
        {
            return (index, order);
        }

        self.unlink(blocks, buddy, order);
        self.unlink(blocks, index, order);
        let lower = index & !size;
        self.push(blocks, lower, order + 1);
        self.merge(blocks, lower, order + 1)
    }

    /// Labels every unit of the block and queues it at the front of its list.
    fn push<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, index: u32, order: u8) {
        Self::label(blocks, index, order, true);
        blocks.set_next(index, self.heads[order as usize]);
        self.heads[order as usize] = index;
    }

    fn pop<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, order: u8) -> Option<u32> {
        let head = self.head(order)?;
        self.heads[order as usize] = blocks.next(head);
        blocks.set_next(head, INVALID_INDEX);
        Some(head)
    }

    fn unlink<B: BuddyBlocks + ?Sized>(&mut self, blocks: &mut B, index: u32, order: u8) -> bool {
        let slot = order as usize;
        if self.heads[slot] == index {
            self.heads[slot] = blocks.next(index);
            blocks.set_next(index, INVALID_INDEX);
            return true;
        }

        let mut cursor = self.heads[slot];
        while cursor != INVALID_INDEX {
            let next = blocks.next(cursor);
            if next == index {
                blocks.set_next(cursor, blocks.next(index));
                blocks.set_next(index, INVALID_INDEX);
                return true;
            }
            cursor = next;
        }
        false
    }

    fn label<B: BuddyBlocks + ?Sized>(blocks: &mut B, index: u32, order: u8, free: bool) {
        for unit in index..index + (1 << order) {
            blocks.set_order(unit, order);
            blocks.set_free(unit, free);
        }
    }
}

/// Largest order a block starting at `index` may take with `remaining` units left.
///
/// Used to cut an arbitrary run of units into naturally aligned blocks.
pub fn largest_order(index: usize, remaining: usize, max_order: u8) -> u8 {
    debug_assert!(remaining > 0);
    let alignment = if index == 0 { u32::MAX } else { index.trailing_zeros() };
    let fit = usize::BITS - 1 - remaining.leading_zeros();
    alignment.min(fit).min(max_order as u32) as u8
}

impl<const N: usize> Default for FreeLists<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Unit {
        next: u32,
        order: u8,
        free: bool,
        pool: u8,
    }

    /// Minimal arena; units with different `pool` values never merge.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestBlocks(Vec<Unit>);

    impl TestBlocks {
        fn new(len: usize) -> Self {
            Self(
                (0..len)
                    .map(|_| Unit {
                        next: INVALID_INDEX,
                        order: INVALID_ORDER,
                        free: false,
                        pool: 0,
                    })
                    .collect(),
            )
        }
    }

    impl BuddyBlocks for TestBlocks {
        fn len(&self) -> usize {
            self.0.len()
        }
        fn order(&self, index: u32) -> u8 {
            self.0[index as usize].order
        }
        fn set_order(&mut self, index: u32, order: u8) {
            self.0[index as usize].order = order;
        }
        fn next(&self, index: u32) -> u32 {
            self.0[index as usize].next
        }
        fn set_next(&mut self, index: u32, next: u32) {
            self.0[index as usize].next = next;
        }
        fn is_free(&self, index: u32) -> bool {
            self.0[index as usize].free
        }
        fn set_free(&mut self, index: u32, free: bool) {
            self.0[index as usize].free = free;
        }
        fn same_pool(&self, a: u32, b: u32) -> bool {
            self.0[a as usize].pool == self.0[b as usize].pool
        }
    }

    fn one_block_of_order_3() -> (FreeLists<6>, TestBlocks) {
        let mut blocks = TestBlocks::new(8);
        let mut lists = FreeLists::<6>::new();
        lists.insert(&mut blocks, 0, 3);
        (lists, blocks)
    }

    #[test]
    fn splits_down_to_the_requested_order() {
        let (mut lists, mut blocks) = one_block_of_order_3();

        assert_eq!(lists.alloc(&mut blocks, 1), Ok(0));
        assert_eq!(lists.head(3), None);
        assert_eq!(lists.head(2), Some(4));
        assert_eq!(lists.head(1), Some(2));
        assert_eq!(lists.count(&blocks, 1), 1);
        assert_eq!(lists.head(0), None);

        assert_eq!(lists.alloc(&mut blocks, 1), Ok(2));
        assert_eq!(lists.head(1), None);
        assert_eq!(lists.head(2), Some(4));

        assert_eq!(lists.alloc(&mut blocks, 1), Ok(4));
        assert_eq!(lists.head(1), Some(6));
        assert_eq!(lists.head(2), None);

        assert_eq!(lists.alloc(&mut blocks, 0), Ok(6));
        assert_eq!(lists.head(0), Some(7));
        assert_eq!(lists.alloc(&mut blocks, 0), Ok(7));
        assert_eq!(lists.alloc(&mut blocks, 0), Err(AllocError::OutOfMemory));
        assert!(lists.is_empty());
    }

    #[test]
    fn split_queues_lower_half_first() {
        let (mut lists, mut blocks) = one_block_of_order_3();
        lists.split(&mut blocks, 2).unwrap();
        assert_eq!(lists.head(2), Some(0));
        assert_eq!(blocks.next(0), 4);
        assert_eq!(blocks.next(4), INVALID_INDEX);
        assert!((0..8).all(|unit| blocks.order(unit) == 2 && blocks.is_free(unit)));
    }

    #[test]
    fn alloc_then_free_restores_state() {
        for order in 0..=3 {
            let (mut lists, mut blocks) = one_block_of_order_3();
            let before = (lists.clone().heads, blocks.clone());

            let index = lists.alloc(&mut blocks, order).unwrap();
            assert_eq!(lists.free(&mut blocks, index), Ok((0, 3)));

            assert_eq!((lists.heads, blocks), before);
        }
    }

    #[test]
    fn merge_undoes_split() {
        let (mut lists, mut blocks) = one_block_of_order_3();
        let before = (lists.heads, blocks.clone());

        lists.split(&mut blocks, 2).unwrap();
        let lower = lists.alloc(&mut blocks, 2).unwrap();
        let upper = lists.alloc(&mut blocks, 2).unwrap();
        lists.free(&mut blocks, lower).unwrap();
        assert_eq!(lists.free(&mut blocks, upper), Ok((0, 3)));

        assert_eq!((lists.heads, blocks), before);
    }

    #[test]
    fn rejects_orders_above_maximum() {
        let (mut lists, mut blocks) = one_block_of_order_3();
        assert_eq!(lists.alloc(&mut blocks, 6), Err(AllocError::InvalidOrder));
        assert_eq!(lists.alloc(&mut blocks, 4), Err(AllocError::OutOfMemory));
        assert_eq!(lists.head(3), Some(0));
    }

    #[test]
    fn rejects_bad_frees() {
        let (mut lists, mut blocks) = one_block_of_order_3();
        let index = lists.alloc(&mut blocks, 1).unwrap();

        assert_eq!(lists.free(&mut blocks, 1), Err(AllocError::Misaligned));
        assert_eq!(lists.free(&mut blocks, 4), Err(AllocError::InvalidAddress));
        assert_eq!(lists.free(&mut blocks, 64), Err(AllocError::InvalidAddress));

        lists.free(&mut blocks, index).unwrap();
        assert_eq!(lists.free(&mut blocks, index), Err(AllocError::InvalidAddress));
        assert_eq!(lists.head(3), Some(0));
    }

    #[test]
    fn pools_never_merge() {
        let mut blocks = TestBlocks::new(8);
        for unit in 4..8 {
            blocks.0[unit].pool = 1;
        }
        let mut lists = FreeLists::<6>::new();
        lists.insert(&mut blocks, 0, 2);
        lists.insert(&mut blocks, 4, 2);

        assert_eq!(lists.head(3), None);
        assert_eq!(lists.count(&blocks, 2), 2);
        assert_eq!(lists.free_units(&blocks), 8);
    }

    #[test]
    fn merging_stops_at_maximum_order() {
        let mut blocks = TestBlocks::new(16);
        let mut lists = FreeLists::<3>::new();
        lists.insert(&mut blocks, 0, 2);
        lists.insert(&mut blocks, 4, 2);
        lists.insert(&mut blocks, 8, 2);
        lists.insert(&mut blocks, 12, 2);
        assert_eq!(lists.count(&blocks, 2), 4);
    }

    #[test]
    fn largest_order_respects_alignment_and_length() {
        assert_eq!(largest_order(0, 8, 18), 3);
        assert_eq!(largest_order(4, 8, 18), 2);
        assert_eq!(largest_order(8, 3, 18), 1);
        assert_eq!(largest_order(1 << 20, 1 << 20, 18), 18);
        assert_eq!(largest_order(0, 1 << 12, 9), 9);
    }

    #[test]
    fn take_detaches_a_specific_block() {
        let mut blocks = TestBlocks::new(8);
        let mut lists = FreeLists::<3>::new();
        lists.insert(&mut blocks, 0, 2);
        lists.insert(&mut blocks, 4, 2);
        assert!(lists.take(&mut blocks, 4, 2));
        assert_eq!(lists.head(2), Some(0));
        assert!(!lists.take(&mut blocks, 4, 2));
    }
}
