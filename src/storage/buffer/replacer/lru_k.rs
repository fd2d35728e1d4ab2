use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::types::FrameId;
use crate::storage::buffer::error::BufferPoolError;

/// Per-frame bookkeeping: how often the frame was touched and the timestamps
/// of its most recent K accesses (oldest at the front).
#[derive(Debug)]
struct LruKNode {
    history: VecDeque<u64>,
    accesses: usize,
    evictable: bool,
}

#[derive(Debug, Default)]
struct ReplacerState {
    current_timestamp: u64,
    /// Frames with fewer than K accesses, front = newest insertion.
    /// Eviction pops from the back (FIFO).
    history_list: VecDeque<FrameId>,
    /// Frames with at least K accesses, descending by K-th most recent
    /// access timestamp; the back holds the eviction candidate.
    cache_list: VecDeque<FrameId>,
    nodes: HashMap<FrameId, LruKNode>,
    evictable_in_history: usize,
    evictable_in_cache: usize,
}

/// LRU-K replacement policy. Victims are chosen first among frames with fewer
/// than K recorded accesses (FIFO order), then by the oldest K-th most recent
/// access among fully-accessed frames.
pub struct LruKReplacer {
    num_frames: usize,
    k: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            num_frames,
            k,
            state: Mutex::new(ReplacerState::default()),
        }
    }

    /// Record an access to `frame_id`. Unknown frames are registered with an
    /// empty history; a frame reaching exactly K accesses moves from the
    /// history list to its sorted slot in the cache list.
    pub fn record_access(&self, frame_id: FrameId) {
        assert!(
            (frame_id as usize) < self.num_frames,
            "frame id {} out of range",
            frame_id
        );

        let mut state = self.state.lock();
        state.current_timestamp += 1;
        let now = state.current_timestamp;
        let k = self.k;

        match state.nodes.get_mut(&frame_id) {
            Some(node) => {
                node.accesses += 1;
                node.history.push_back(now);
                if node.history.len() > k {
                    node.history.pop_front();
                }
                let accesses = node.accesses;
                let evictable = node.evictable;

                if accesses == k {
                    // Promotion: K-th access splices the frame into the
                    // cache list.
                    if let Some(pos) = state.history_list.iter().position(|&f| f == frame_id) {
                        state.history_list.remove(pos);
                    }
                    if evictable {
                        state.evictable_in_history -= 1;
                        state.evictable_in_cache += 1;
                    }
                    Self::insert_sorted(&mut state, frame_id);
                } else if accesses > k {
                    if let Some(pos) = state.cache_list.iter().position(|&f| f == frame_id) {
                        state.cache_list.remove(pos);
                    }
                    Self::insert_sorted(&mut state, frame_id);
                }
                // Frames still below K accesses keep their FIFO slot.
            }
            None => {
                let node = LruKNode {
                    history: VecDeque::from(vec![now]),
                    accesses: 1,
                    evictable: false,
                };
                state.nodes.insert(frame_id, node);
                if k == 1 {
                    Self::insert_sorted(&mut state, frame_id);
                } else {
                    state.history_list.push_front(frame_id);
                }
            }
        }
    }

    /// Flip the evictable flag; idempotent. Unknown frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut state = self.state.lock();
        let k = self.k;

        let (changed, in_history) = match state.nodes.get_mut(&frame_id) {
            Some(node) if node.evictable != evictable => {
                node.evictable = evictable;
                (true, node.accesses < k)
            }
            _ => return,
        };

        if changed {
            let delta: isize = if evictable { 1 } else { -1 };
            if in_history {
                state.evictable_in_history =
                    (state.evictable_in_history as isize + delta) as usize;
            } else {
                state.evictable_in_cache = (state.evictable_in_cache as isize + delta) as usize;
            }
        }
    }

    /// Evict the best candidate: the tail-most evictable frame of the history
    /// list, falling back to the cache list. Returns None when nothing is
    /// evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();

        if state.evictable_in_history > 0 {
            if let Some(pos) = state
                .history_list
                .iter()
                .rposition(|f| state.nodes[f].evictable)
            {
                let frame_id = state.history_list.remove(pos).unwrap();
                state.nodes.remove(&frame_id);
                state.evictable_in_history -= 1;
                return Some(frame_id);
            }
        }

        if state.evictable_in_cache > 0 {
            if let Some(pos) = state
                .cache_list
                .iter()
                .rposition(|f| state.nodes[f].evictable)
            {
                let frame_id = state.cache_list.remove(pos).unwrap();
                state.nodes.remove(&frame_id);
                state.evictable_in_cache -= 1;
                return Some(frame_id);
            }
        }

        None
    }

    /// Forcibly drop a frame from the replacer. Unknown frames are a no-op;
    /// removing a non-evictable frame is an error.
    pub fn remove(&self, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let k = self.k;

        let in_history = match state.nodes.get(&frame_id) {
            None => return Ok(()),
            Some(node) if !node.evictable => {
                return Err(BufferPoolError::FrameNotEvictable(frame_id));
            }
            Some(node) => node.accesses < k,
        };

        if in_history {
            if let Some(pos) = state.history_list.iter().position(|&f| f == frame_id) {
                state.history_list.remove(pos);
            }
            state.evictable_in_history -= 1;
        } else {
            if let Some(pos) = state.cache_list.iter().position(|&f| f == frame_id) {
                state.cache_list.remove(pos);
            }
            state.evictable_in_cache -= 1;
        }
        state.nodes.remove(&frame_id);

        Ok(())
    }

    /// Number of evictable frames.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.evictable_in_history + state.evictable_in_cache
    }

    /// Insert into the cache list keeping it descending by the K-th most
    /// recent access timestamp. Ties go behind existing entries, so the
    /// earlier insertion is evicted first.
    fn insert_sorted(state: &mut ReplacerState, frame_id: FrameId) {
        let key = state.nodes[&frame_id]
            .history
            .front()
            .copied()
            .unwrap_or(0);
        let pos = state
            .cache_list
            .iter()
            .position(|f| {
                state.nodes[f].history.front().copied().unwrap_or(0) < key
            })
            .unwrap_or(state.cache_list.len());
        state.cache_list.insert(pos, frame_id);
    }
}
