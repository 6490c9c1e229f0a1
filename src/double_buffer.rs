use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::ErrorKind;

/// One side of a [`HotDoubleBuffer`].
///
/// `hot` is the producer/consumer handoff signal: the worker sets it after
/// filling `data`, the caller clears it after copying `data` out. Only the
/// side that currently owns the slot (worker while hot, caller while cold)
/// is expected to touch `data` or `last_error`.
#[derive(Debug, Default)]
struct Slot {
    data: Mutex<BytesMut>,
    hot: AtomicBool,
    last_error: Mutex<Option<ErrorKind>>,
}

/// Two fixed-capacity byte slots with a "hand out current, switch to
/// other" selector. The worker writes one slot at a time; the caller reads
/// whichever slot `get_and_swap` last handed out.
///
/// Capacity is fixed at construction. Per the spec's invariant, a slot must
/// never be written while its `hot` flag is true — callers are expected to
/// copy data out of a view and call [`BufferView::clear_hot`] promptly.
#[derive(Debug)]
pub struct HotDoubleBuffer {
    slots: [Slot; 2],
    capacity: usize,
    current: AtomicUsize,
}

impl HotDoubleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: [Slot::default(), Slot::default()],
            capacity,
            current: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hands out a view onto the current slot and flips the selector so the
    /// next call returns the other side.
    pub fn get_and_swap(&self) -> BufferView<'_> {
        let idx = self.current.fetch_xor(1, Ordering::AcqRel) & 1;
        self.view(idx)
    }

    /// Returns a view onto a specific slot without touching the selector.
    /// Used to re-obtain the exact slot a previously issued async read
    /// targeted, since only `next_chunk` (the caller context) calls
    /// `get_and_swap`.
    pub fn view(&self, idx: usize) -> BufferView<'_> {
        BufferView {
            slot: &self.slots[idx & 1],
            idx: idx & 1,
        }
    }
}

/// A non-owning reference to one slot of a [`HotDoubleBuffer`]. Must not
/// outlive the buffer it was handed out from.
pub struct BufferView<'a> {
    slot: &'a Slot,
    idx: usize,
}

impl<'a> BufferView<'a> {
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn is_hot(&self) -> bool {
        self.slot.hot.load(Ordering::Acquire)
    }

    /// Called by the worker after filling `data` for this slot.
    pub fn fill(&self, bytes: &[u8], error: Option<ErrorKind>) {
        debug_assert!(
            !self.is_hot(),
            "hot double buffer slot written while still hot"
        );
        *self.slot.data.lock() = BytesMut::from(bytes);
        *self.slot.last_error.lock() = error;
        self.slot.hot.store(true, Ordering::Release);
    }

    /// Copies the slot's current contents out and clears the hot flag, as
    /// the caller is expected to do promptly after reading.
    pub fn take(&self) -> (BytesMut, Option<ErrorKind>) {
        let data = self.slot.data.lock().split();
        let error = self.slot.last_error.lock().take();
        self.slot.hot.store(false, Ordering::Release);
        (data, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_alternates_sides() {
        let buf = HotDoubleBuffer::new(4096);
        let first = buf.get_and_swap();
        assert!(!first.is_hot());
        first.fill(b"abcd", None);
        assert!(first.is_hot());

        let second = buf.get_and_swap();
        assert!(!second.is_hot());

        let (data, err) = first.take();
        assert_eq!(&data[..], b"abcd");
        assert!(err.is_none());
        assert!(!first.is_hot());
    }
}
