use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use std::collections::HashSet;

use log::{debug, trace};
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};

use crate::common::config::EngineConfig;
use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;
use crate::storage::page::{PageGuard, ReadPageGuard, WritePageGuard};

/// Per-frame metadata, mutated only under the pool mutex.
#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn empty() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    metas: Vec<FrameMeta>,
    /// Pages whose eviction write-back is still in flight. A fetch of such a
    /// page must wait, or it would read stale bytes from disk.
    flushing: HashSet<PageId>,
}

/// Pending disk work for a frame that was just (re)assigned. The write latch
/// was acquired inside the pool critical section, so the I/O itself happens
/// with no pool-wide lock held.
struct LoadPlan {
    latch: ArcRwLockWriteGuard<RawRwLock, Page>,
    evicted_page_id: PageId,
    evicted_dirty: bool,
}

/// BufferPoolManager caches fixed-size pages over a DiskManager, keeping at
/// most one in-memory copy of each page and writing dirty frames back before
/// reuse. Access goes through RAII page guards that pin the frame for their
/// lifetime.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PagePtr>,
    state: Mutex<PoolState>,
    flush_cv: Condvar,
    replacer: LruKReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            frames.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            free_list.push_back(i as FrameId);
        }

        Ok(Self {
            pool_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                metas: vec![FrameMeta::empty(); pool_size],
                flushing: HashSet::new(),
            }),
            flush_cv: Condvar::new(),
            replacer: LruKReplacer::new(pool_size, replacer_k),
            disk_manager,
        })
    }

    pub fn from_config(
        config: &EngineConfig,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        Self::new(config.pool_size, config.replacer_k, db_path)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page id, reserve a frame for it, zero its contents
    /// and return the id with a pinned guard.
    pub fn new_page(self: &Arc<Self>) -> Result<(PageId, PageGuard), BufferPoolError> {
        let page_id = self.disk_manager.allocate_page();
        let (ptr, plan) = self.assign_frame(page_id)?;

        // A brand-new page never reads from disk; the frame is zeroed in
        // place while the evicted occupant (if any) is written back.
        if let Some(mut plan) = plan {
            if let Err(e) = self.write_back_evicted(&mut plan) {
                self.abandon_frame(page_id, plan);
                return Err(e);
            }
            plan.latch.reset(page_id);
        }

        debug!("new page {}", page_id);
        Ok((page_id, PageGuard::new(Arc::clone(self), ptr, page_id)))
    }

    /// Fetch a page without latching it.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard, BufferPoolError> {
        let (ptr, plan) = self.assign_frame(page_id)?;
        if let Some(mut plan) = plan {
            if let Err(e) = self.load_page(page_id, &mut plan) {
                self.abandon_frame(page_id, plan);
                return Err(e);
            }
        }
        Ok(PageGuard::new(Arc::clone(self), ptr, page_id))
    }

    /// Fetch a page and take its shared latch.
    pub fn fetch_page_read(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> Result<ReadPageGuard, BufferPoolError> {
        let (ptr, plan) = self.assign_frame(page_id)?;
        if let Some(mut plan) = plan {
            if let Err(e) = self.load_page(page_id, &mut plan) {
                self.abandon_frame(page_id, plan);
                return Err(e);
            }
            drop(plan);
        }
        let latch = ptr.read_arc();
        Ok(ReadPageGuard::new(
            latch,
            PageGuard::new(Arc::clone(self), ptr, page_id),
        ))
    }

    /// Fetch a page and take its exclusive latch. The resulting guard marks
    /// the frame dirty on release.
    pub fn fetch_page_write(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> Result<WritePageGuard, BufferPoolError> {
        let (ptr, plan) = self.assign_frame(page_id)?;
        let latch = match plan {
            Some(mut plan) => {
                if let Err(e) = self.load_page(page_id, &mut plan) {
                    self.abandon_frame(page_id, plan);
                    return Err(e);
                }
                plan.latch
            }
            None => ptr.write_arc(),
        };
        Ok(WritePageGuard::new(
            latch,
            PageGuard::new(Arc::clone(self), ptr, page_id),
        ))
    }

    /// Drop one pin on a resident page. The dirty hint OR-accumulates: once
    /// a page is marked dirty it stays dirty until flushed.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = *state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotResident(page_id))?;

        let meta = &mut state.metas[frame_id as usize];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;

        if meta.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        Ok(())
    }

    /// Write a page back to disk and clear its dirty bit.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let (ptr, frame_id) = {
            let state = self.state.lock();
            let frame_id = *state
                .page_table
                .get(&page_id)
                .ok_or(BufferPoolError::PageNotResident(page_id))?;
            if !state.metas[frame_id as usize].is_dirty {
                return Ok(());
            }
            (Arc::clone(&self.frames[frame_id as usize]), frame_id)
        };

        // Snapshot the page outside the pool mutex, then write it out.
        let snapshot = ptr.read().clone();
        self.disk_manager.write_page(&snapshot)?;

        let mut state = self.state.lock();
        // The frame may have been re-targeted while we were writing; only
        // clear the dirty bit if it still hosts the same page.
        if state.page_table.get(&page_id) == Some(&frame_id) {
            state.metas[frame_id as usize].is_dirty = false;
        }
        Ok(())
    }

    /// Flush every resident page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let page_ids: Vec<PageId> = {
            let state = self.state.lock();
            state.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            match self.flush_page(page_id) {
                Ok(()) => {}
                // Evicted between the snapshot and the flush; its writeback
                // already happened.
                Err(BufferPoolError::PageNotResident(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drop a page from the pool and deallocate its id. Deleting a page that
    /// is not resident succeeds; deleting a pinned page fails.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let plan = {
            let mut state = self.state.lock();
            let frame_id = match state.page_table.get(&page_id) {
                Some(&f) => f,
                None => {
                    self.disk_manager.deallocate_page(page_id);
                    return Ok(());
                }
            };

            if state.metas[frame_id as usize].pin_count > 0 {
                return Err(BufferPoolError::PagePinned(page_id));
            }

            self.replacer.remove(frame_id)?;
            let dirty = state.metas[frame_id as usize].is_dirty;
            state.page_table.remove(&page_id);
            state.metas[frame_id as usize] = FrameMeta::empty();

            // Snapshot before the frame goes back on the free list, where
            // another thread could claim and overwrite it.
            let snapshot = if dirty {
                state.flushing.insert(page_id);
                Some(self.frames[frame_id as usize].read().clone())
            } else {
                None
            };
            state.free_list.push_back(frame_id);
            snapshot
        };

        if let Some(snapshot) = plan {
            let result = self.disk_manager.write_page(&snapshot);
            let mut state = self.state.lock();
            state.flushing.remove(&page_id);
            self.flush_cv.notify_all();
            drop(state);
            result?;
        }
        self.disk_manager.deallocate_page(page_id);
        trace!("deleted page {}", page_id);
        Ok(())
    }

    /// Map `page_id` to a frame, pinning it. Returns the page pointer and,
    /// for a frame that was just assigned, a LoadPlan whose write latch was
    /// acquired before the pool mutex was released.
    fn assign_frame(
        &self,
        page_id: PageId,
    ) -> Result<(PagePtr, Option<LoadPlan>), BufferPoolError> {
        let mut state = self.state.lock();

        // If this page's eviction write-back has not finished, reading it
        // from disk now would resurrect stale data.
        while state.flushing.contains(&page_id) {
            self.flush_cv.wait(&mut state);
        }

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.metas[frame_id as usize].pin_count += 1;
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok((Arc::clone(&self.frames[frame_id as usize]), None));
        }

        let frame_id = match state.free_list.pop_front() {
            Some(f) => f,
            None => self.replacer.evict().ok_or(BufferPoolError::PoolFull)?,
        };

        let old = state.metas[frame_id as usize];
        if old.page_id != INVALID_PAGE_ID {
            state.page_table.remove(&old.page_id);
            if old.is_dirty {
                state.flushing.insert(old.page_id);
            }
            trace!("evicting page {} from frame {}", old.page_id, frame_id);
        }

        state.metas[frame_id as usize] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        state.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        // The victim had pin count zero, so no guard holds this latch; taking
        // it under the mutex cannot block. Everyone else who finds the new
        // page-table entry will queue on the latch until the load finishes.
        let ptr = Arc::clone(&self.frames[frame_id as usize]);
        let latch = ptr.write_arc();
        drop(state);

        Ok((
            ptr,
            Some(LoadPlan {
                latch,
                evicted_page_id: old.page_id,
                evicted_dirty: old.is_dirty,
            }),
        ))
    }

    /// Undo a frame assignment whose disk load failed: drop this caller's
    /// pin and, if nobody else pinned the page meanwhile, tear the mapping
    /// down and return the frame to the free list.
    fn abandon_frame(&self, page_id: PageId, plan: LoadPlan) {
        drop(plan.latch);
        let mut state = self.state.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let meta = &mut state.metas[frame_id as usize];
            meta.pin_count = meta.pin_count.saturating_sub(1);
            if meta.pin_count == 0 {
                state.metas[frame_id as usize] = FrameMeta::empty();
                state.page_table.remove(&page_id);
                self.replacer.set_evictable(frame_id, true);
                let _ = self.replacer.remove(frame_id);
                state.free_list.push_back(frame_id);
            }
        }
    }

    fn write_back_evicted(&self, plan: &mut LoadPlan) -> Result<(), BufferPoolError> {
        if plan.evicted_dirty && plan.evicted_page_id != INVALID_PAGE_ID {
            let result = self.disk_manager.write_page(&plan.latch);

            // Waiters blocked on this page may proceed once the write-back
            // is out of flight, even if it failed.
            let mut state = self.state.lock();
            state.flushing.remove(&plan.evicted_page_id);
            self.flush_cv.notify_all();
            drop(state);

            result?;
        }
        Ok(())
    }

    /// Flush the evicted occupant (if dirty) and read the requested page
    /// into the frame, all under the frame's write latch.
    fn load_page(&self, page_id: PageId, plan: &mut LoadPlan) -> Result<(), BufferPoolError> {
        self.write_back_evicted(plan)?;
        self.disk_manager.read_page(page_id, &mut plan.latch)?;
        Ok(())
    }

    /// Test-support inspection: the pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        let frame_id = *state.page_table.get(&page_id)?;
        Some(state.metas[frame_id as usize].pin_count)
    }
}
