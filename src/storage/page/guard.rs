use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::types::{Page, PageId, PagePtr};
use crate::storage::buffer::BufferPoolManager;

/// Scoped pin on a buffer pool page. Dropping the guard unpins the page,
/// handing the accumulated dirty flag to the buffer pool. Move-only.
pub struct PageGuard {
    bpm: Arc<BufferPoolManager>,
    page: PagePtr,
    page_id: PageId,
    is_dirty: bool,
}

impl PageGuard {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, page: PagePtr, page_id: PageId) -> Self {
        Self {
            bpm,
            page,
            page_id,
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The underlying page; callers latch it themselves.
    pub fn page(&self) -> &PagePtr {
        &self.page
    }

    /// Record that the holder modified the page. The flag is handed to the
    /// buffer pool when the guard drops.
    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        // The page can only be non-resident if the pool was torn down first;
        // nothing useful to do with the error inside a destructor.
        let _ = self.bpm.unpin_page(self.page_id, self.is_dirty);
    }
}

/// Pin plus shared latch. Field order matters: the latch releases before the
/// pin is dropped.
pub struct ReadPageGuard {
    latch: ArcRwLockReadGuard<RawRwLock, Page>,
    inner: PageGuard,
}

impl ReadPageGuard {
    pub(crate) fn new(latch: ArcRwLockReadGuard<RawRwLock, Page>, inner: PageGuard) -> Self {
        Self { latch, inner }
    }

    pub fn page_id(&self) -> PageId {
        self.inner.page_id()
    }
}

impl Deref for ReadPageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.latch
    }
}

/// Pin plus exclusive latch. Creation marks the page dirty: a write guard
/// exists precisely to modify the page. The latch releases before the pin.
pub struct WritePageGuard {
    latch: ArcRwLockWriteGuard<RawRwLock, Page>,
    inner: PageGuard,
}

impl WritePageGuard {
    pub(crate) fn new(latch: ArcRwLockWriteGuard<RawRwLock, Page>, mut inner: PageGuard) -> Self {
        inner.mark_dirty();
        Self { latch, inner }
    }

    pub fn page_id(&self) -> PageId {
        self.inner.page_id()
    }
}

impl Deref for WritePageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.latch
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.latch
    }
}
