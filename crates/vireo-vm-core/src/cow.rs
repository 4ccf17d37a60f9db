//! Copy-on-write buffers

use std::cell::Cell;
use std::sync::Arc;

/// A copy-on-write buffer: strong count, sharedness flag, and the data.
///
/// `get_read` hands out the current buffer; `get_write` clones first when
/// the buffer is shared (count > 1 or the flag is set) and then returns an
/// exclusive reference. `retain` bumps the count and raises the sharedness
/// flag on both sides once the buffer has more than one holder.
///
/// The flag (not just the count) matters: a holder that observed sharing
/// must copy on its next write even if the other holders released in the
/// meantime on another value path.
pub struct CowBuf<T: Clone> {
    buf: Arc<T>,
    shared: Cell<bool>,
}

impl<T: Clone> CowBuf<T> {
    /// Wrap a fresh exclusive buffer
    pub fn new(value: T) -> Self {
        Self {
            buf: Arc::new(value),
            shared: Cell::new(false),
        }
    }

    /// Borrow the buffer for reading
    #[inline]
    pub fn get_read(&self) -> &T {
        &self.buf
    }

    /// Borrow the buffer for writing, cloning it first if shared.
    ///
    /// Returns the exclusive buffer and whether a clone happened (callers
    /// that hold reference-counted values inside `T` re-retain after a
    /// clone).
    pub fn get_write(&mut self) -> (&mut T, bool) {
        let must_clone = Arc::strong_count(&self.buf) > 1 || self.shared.get();
        if must_clone {
            self.buf = Arc::new((*self.buf).clone());
            self.shared.set(false);
        }
        let buf = Arc::get_mut(&mut self.buf)
            .unwrap_or_else(|| unreachable!("buffer exclusive after clone"));
        (buf, must_clone)
    }

    /// Share the buffer: increments the strong count and marks both sides
    /// shared once more than one holder exists.
    pub fn retain(&self) -> Self {
        let copy = Self {
            buf: Arc::clone(&self.buf),
            shared: Cell::new(false),
        };
        if Arc::strong_count(&self.buf) > 1 {
            self.shared.set(true);
            copy.shared.set(true);
        }
        copy
    }

    /// Current strong count of the underlying buffer
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.buf)
    }

    /// Has this holder observed sharing?
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.buf) > 1 || self.shared.get()
    }
}

impl<T: Clone> Clone for CowBuf<T> {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for CowBuf<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CowBuf")
            .field("refcount", &self.refcount())
            .field("shared", &self.shared.get())
            .field("data", &*self.buf)
            .finish()
    }
}
