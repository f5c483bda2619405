//! A process-wide slab for packed (wire-format) cells.
//!
//! Cells waiting on a circuit queue are stored in their on-the-wire
//! form, so that flushing them to a transport buffer is a plain copy.
//! The pool hands out small integer handles rather than pointers; each
//! block is exactly one wire cell plus the link word that the cell
//! queues thread through it.

use onion_cell::chancell::{Cell, CELL_NETWORK_LEN};

/// The wire image of one cell, as stored in the pool.
pub(crate) type PackedCellBody = [u8; CELL_NETWORK_LEN];

/// Handle to one packed cell in a [`CellPool`].
///
/// A handle is only meaningful to the pool that issued it, and only
/// until the cell is released.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct CellHandle(u32);

/// One block of the pool.
struct PoolSlot {
    /// The cell's wire image.  `None` when the slot is free and its
    /// storage has been returned by [`CellPool::clean`].
    body: Option<Box<PackedCellBody>>,
    /// Link to the next cell on whatever queue this cell is on.
    next: Option<CellHandle>,
}

/// A slab allocator for packed cells.
///
/// There is one pool per engine; every cell queue holds handles into
/// it.  The pool keeps released blocks around for reuse; `clean`
/// returns their storage when memory pressure calls for it.
pub(crate) struct CellPool {
    /// All blocks ever created, free or not.
    slots: Vec<PoolSlot>,
    /// Indices of the free blocks.
    free: Vec<u32>,
    /// Number of live (allocated, unreleased) cells.
    n_allocated: usize,
}

impl CellPool {
    /// Create a new, empty pool.
    pub(crate) fn new() -> Self {
        CellPool {
            slots: Vec::new(),
            free: Vec::new(),
            n_allocated: 0,
        }
    }

    /// Allocate a block and fill it with the wire image of `cell`.
    pub(crate) fn alloc_copy(&mut self, cell: &Cell) -> CellHandle {
        let handle = self.alloc();
        *self.body_mut(handle) = cell.pack();
        handle
    }

    /// Allocate an uninitialized block.
    fn alloc(&mut self) -> CellHandle {
        self.n_allocated += 1;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            if slot.body.is_none() {
                slot.body = Some(Box::new([0_u8; CELL_NETWORK_LEN]));
            }
            slot.next = None;
            CellHandle(idx)
        } else {
            let idx = u32::try_from(self.slots.len()).expect("cell pool exhausted the u32 range");
            self.slots.push(PoolSlot {
                body: Some(Box::new([0_u8; CELL_NETWORK_LEN])),
                next: None,
            });
            CellHandle(idx)
        }
    }

    /// Release a block back to the pool.
    ///
    /// The handle must not be used afterwards, and the cell must not be
    /// on any queue.
    pub(crate) fn release(&mut self, handle: CellHandle) {
        debug_assert!(self.slots[handle.0 as usize].body.is_some());
        self.slots[handle.0 as usize].next = None;
        self.n_allocated -= 1;
        self.free.push(handle.0);
    }

    /// Return the wire image of a live cell.
    pub(crate) fn body(&self, handle: CellHandle) -> &PackedCellBody {
        self.slots[handle.0 as usize]
            .body
            .as_deref()
            .expect("cell handle refers to a cleaned slot")
    }

    /// Return the wire image of a live cell, mutably.
    pub(crate) fn body_mut(&mut self, handle: CellHandle) -> &mut PackedCellBody {
        self.slots[handle.0 as usize]
            .body
            .as_deref_mut()
            .expect("cell handle refers to a cleaned slot")
    }

    /// Return the queue link of a cell.
    pub(crate) fn next(&self, handle: CellHandle) -> Option<CellHandle> {
        self.slots[handle.0 as usize].next
    }

    /// Set the queue link of a cell.
    pub(crate) fn set_next(&mut self, handle: CellHandle, next: Option<CellHandle>) {
        self.slots[handle.0 as usize].next = next;
    }

    /// Number of live cells in the pool.
    pub(crate) fn n_allocated(&self) -> usize {
        self.n_allocated
    }

    /// Return excess storage to the allocator.
    ///
    /// When `aggressive`, every free block's storage is dropped;
    /// otherwise half of them keep their storage for quick reuse.
    pub(crate) fn clean(&mut self, aggressive: bool) {
        let keep = if aggressive { 0 } else { self.free.len() / 2 };
        for &idx in self.free.iter().skip(keep) {
            self.slots[idx as usize].body = None;
        }
    }

    /// Report the pool's leak counter: cells allocated but not found on
    /// any queue.
    ///
    /// `n_queued` is the sum of all queue lengths, as counted by the
    /// caller.  The counter is advisory; it is reported, never
    /// enforced.
    pub(crate) fn leaked(&self, n_queued: usize) -> usize {
        self.n_allocated.saturating_sub(n_queued)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use onion_cell::chancell::{ChanCmd, CircId};

    fn cell() -> Cell {
        let mut body = Box::new([0_u8; 509]);
        body[0] = 0xAB;
        Cell::new(CircId::new(5).unwrap(), ChanCmd::RELAY, body)
    }

    #[test]
    fn alloc_release_reuse() {
        let mut pool = CellPool::new();
        let h1 = pool.alloc_copy(&cell());
        let h2 = pool.alloc_copy(&cell());
        assert_eq!(pool.n_allocated(), 2);
        assert_ne!(h1, h2);
        assert_eq!(pool.body(h1)[0..3], [0, 5, 3]);
        assert_eq!(pool.body(h1)[3], 0xAB);

        pool.release(h1);
        assert_eq!(pool.n_allocated(), 1);
        // The freed block is reused.
        let h3 = pool.alloc_copy(&cell());
        assert_eq!(h3, h1);
        assert_eq!(pool.n_allocated(), 2);
    }

    #[test]
    fn clean_returns_storage() {
        let mut pool = CellPool::new();
        let handles: Vec<_> = (0..8).map(|_| pool.alloc_copy(&cell())).collect();
        for h in handles {
            pool.release(h);
        }
        pool.clean(false);
        pool.clean(true);
        assert_eq!(pool.n_allocated(), 0);
        // Cleaned slots are re-boxed on demand.
        let h = pool.alloc_copy(&cell());
        assert_eq!(pool.body(h)[3], 0xAB);
    }

    #[test]
    fn leak_counter() {
        let mut pool = CellPool::new();
        let _h1 = pool.alloc_copy(&cell());
        let _h2 = pool.alloc_copy(&cell());
        assert_eq!(pool.leaked(1), 1);
        assert_eq!(pool.leaked(2), 0);
        assert_eq!(pool.leaked(5), 0);
    }
}
