//! Paged append buffer.

use std::collections::VecDeque;

use tributary_core::WalEntry;

/// Entries accumulate into the open page; a page seals when it reaches
/// `page_size`. Total buffered entries are bounded by
/// `page_size * max_pages`, which is the backpressure limit appenders wait
/// on. A failed flush re-queues its batch at the head so retry order
/// preserves LSN order.
pub(crate) struct PageBuffer {
    sealed: VecDeque<Vec<WalEntry>>,
    open: Vec<WalEntry>,
    page_size: usize,
    capacity: usize,
}

impl PageBuffer {
    pub(crate) fn new(page_size: usize, page_count: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            sealed: VecDeque::new(),
            open: Vec::with_capacity(page_size),
            page_size,
            capacity: page_size * page_count.max(1),
        }
    }

    /// Entries currently buffered across all pages.
    pub(crate) fn len(&self) -> usize {
        self.sealed.iter().map(Vec::len).sum::<usize>() + self.open.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.open.is_empty()
    }

    /// Free slots before the buffer hits its backpressure bound.
    pub(crate) fn free(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an entry to the open page. Returns true when the push sealed
    /// a page (a hint that the flusher should run).
    ///
    /// Callers must check `free() > 0` first; exceeding capacity is a logic
    /// error upstream.
    pub(crate) fn push(&mut self, entry: WalEntry) -> bool {
        debug_assert!(self.free() > 0, "push into a full page buffer");
        self.open.push(entry);
        if self.open.len() >= self.page_size {
            let page = std::mem::replace(&mut self.open, Vec::with_capacity(self.page_size));
            self.sealed.push_back(page);
            true
        } else {
            false
        }
    }

    /// Takes every buffered entry, oldest first, leaving the buffer empty.
    pub(crate) fn drain_all(&mut self) -> Vec<WalEntry> {
        let mut batch: Vec<WalEntry> =
            Vec::with_capacity(self.sealed.iter().map(Vec::len).sum::<usize>() + self.open.len());
        for page in self.sealed.drain(..) {
            batch.extend(page);
        }
        batch.append(&mut self.open);
        batch
    }

    /// Re-queues a failed flush batch ahead of everything buffered since.
    pub(crate) fn requeue_front(&mut self, batch: Vec<WalEntry>) {
        if !batch.is_empty() {
            self.sealed.push_front(batch);
        }
    }
}
