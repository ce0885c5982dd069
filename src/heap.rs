/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use crate::bitfield::{self, Status};
use crate::debug::{DiagSink, NullSink};
use crate::defines::{level_size, LEVELS, MIN_ALIGN};
use crate::diag;
use crate::errors::HeapError;
use crate::freelist::FreeListRegistry;
use crate::lock::{LockHook, NullLock};

#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct LevelMeta {
    pub word_offset: usize,
    pub num_words: usize,
    /// chunks whose full `Sk` range lies inside `[base, base+size)`. The
    /// rest, up to `num_words*16`, is out-of-region padding.
    pub chunks_in_region: usize,
}

/// Every level `0..=top` is sized to fully tile the region at that level's
/// granularity (spec's `bf_cnt = Σ ceil(chunks_at_level/16)`), since a
/// runtime split can bring any of them into use — not just the levels the
/// initial seeding happens to touch.
fn plan_levels(size: u32) -> ([LevelMeta; LEVELS], usize) {
    let top = (0..LEVELS)
        .rev()
        .find(|&k| level_size(k) <= size)
        .expect("size already validated to be >= MIN_ALIGN");

    let mut levels = [LevelMeta::default(); LEVELS];
    let mut offset = 0usize;
    for k in 0..=top {
        let sk = level_size(k) as u64;
        let chunks_in_region = ((size as u64 + sk - 1) / sk) as usize;
        let num_words = (chunks_in_region + 15) / 16;
        levels[k] = LevelMeta {
            word_offset: offset,
            num_words,
            chunks_in_region,
        };
        offset += num_words;
    }
    (levels, top)
}

/// Number of `u32` words the per-chunk status bitfield needs for a region of
/// `size` bytes. The caller allocates a buffer of this length and passes it
/// to `Heap::create` — the engine itself never calls an allocator.
pub fn bitfield_words_for(size: u32) -> Result<usize, HeapError> {
    if size == 0 || size % MIN_ALIGN != 0 {
        return Err(HeapError::InvalidHeapGeometry);
    }
    let (levels, top) = plan_levels(size);
    Ok(levels[top].word_offset + levels[top].num_words)
}

/// A free-carving block allocator over the externally-owned region
/// `[base, base+size)`. `bitfield` backs the per-chunk status words; the 105
/// free-list heads and the occupancy bitmap are constant-size and live
/// directly in this struct.
pub struct Heap<'a> {
    pub(crate) base: usize,
    pub(crate) size: u32,
    pub(crate) levels: [LevelMeta; LEVELS],
    pub(crate) top: usize,
    pub(crate) bitfield: &'a mut [u32],
    pub(crate) registry: FreeListRegistry,
    lock: &'a dyn LockHook,
    sink: &'a dyn DiagSink,
}

impl<'a> core::fmt::Debug for Heap<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("levels", &self.levels)
            .field("top", &self.top)
            .field("bitfield", &self.bitfield)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<'a> Heap<'a> {
    /// Construct a heap with no-op locking and diagnostics.
    ///
    /// `base` must be nonzero: address 0 doubles as the null sentinel
    /// `alloc`/`free` use, so a heap based there could hand out an address
    /// indistinguishable from failure.
    pub fn create(base: usize, size: u32, bitfield: &'a mut [u32]) -> Result<Self, HeapError> {
        static NULL_LOCK: NullLock = NullLock;
        static NULL_SINK: NullSink = NullSink;
        Self::create_with(base, size, bitfield, &NULL_LOCK, &NULL_SINK)
    }

    /// Construct a heap bound to an embedder-supplied lock hook and
    /// diagnostic sink.
    pub fn create_with(
        base: usize,
        size: u32,
        bitfield: &'a mut [u32],
        lock: &'a dyn LockHook,
        sink: &'a dyn DiagSink,
    ) -> Result<Self, HeapError> {
        if size == 0 || size % MIN_ALIGN != 0 {
            diag!(sink, crate::debug::CRITICAL, "heap: size not 16-aligned\n");
            return Err(HeapError::InvalidHeapGeometry);
        }
        let (levels, top) = plan_levels(size);
        let top_align = level_size(top) as usize;
        if base % top_align != 0 {
            diag!(sink, crate::debug::CRITICAL, "heap: base misaligned\n");
            return Err(HeapError::InvalidHeapGeometry);
        }
        let needed = levels[top].word_offset + levels[top].num_words;
        if bitfield.len() < needed {
            diag!(sink, crate::debug::CRITICAL, "heap: bitfield buffer too small\n");
            return Err(HeapError::InvalidHeapGeometry);
        }
        for w in bitfield[..needed].iter_mut() {
            *w = 0;
        }

        let mut heap = Heap {
            base,
            size,
            levels,
            top,
            bitfield,
            registry: FreeListRegistry::new(),
            lock,
            sink,
        };
        heap.pad_out_of_region_tails();
        heap.seed_free_lists();
        Ok(heap)
    }

    /// Chunks whose range runs past `base+size` can never be FREE; mark them
    /// ALLOC_HEAD up front so they read as already-owned.
    fn pad_out_of_region_tails(&mut self) {
        for k in 0..=self.top {
            let meta = self.levels[k];
            let total = meta.num_words * 16;
            for idx in meta.chunks_in_region..total {
                bitfield::set_one(self.words_mut(k), idx, Status::AllocHead);
            }
        }
    }

    /// Decompose `size` into per-level chunk-count digits (base-16, one
    /// digit per level) and place each nonzero digit as an initial free run;
    /// a level whose remainder continues below gets a SPLIT chunk marking
    /// the boundary. Levels finer than where the remainder reaches zero stay
    /// untouched until a future split brings them into use.
    fn seed_free_lists(&mut self) {
        let mut addr = self.base;
        let mut rem = self.size;
        for k in (0..=self.top).rev() {
            let sk = level_size(k);
            let d = (rem / sk) as usize;
            rem -= d as u32 * sk;
            if d > 0 {
                let idx = self.chunk_index(k, addr);
                bitfield::set_run(self.words_mut(k), idx, d, Status::Free);
                self.registry.push_head(15 * k + d - 1, addr);
                addr += d * sk as usize;
            }
            if rem == 0 {
                break;
            }
            debug_assert!(k > 0, "size is a multiple of 16, so level 0 has no remainder");
            let idx = self.chunk_index(k, addr);
            bitfield::set_one(self.words_mut(k), idx, Status::Split);
        }
    }

    pub(crate) fn chunk_index(&self, level: usize, addr: usize) -> usize {
        (addr - self.base) >> (4 * (level as u32 + 1))
    }

    pub(crate) fn addr_of(&self, level: usize, idx: usize) -> usize {
        self.base + (idx << (4 * (level as u32 + 1)))
    }

    pub(crate) fn words(&self, level: usize) -> &[u32] {
        let meta = self.levels[level];
        &self.bitfield[meta.word_offset..meta.word_offset + meta.num_words]
    }

    pub(crate) fn words_mut(&mut self, level: usize) -> &mut [u32] {
        let meta = self.levels[level];
        &mut self.bitfield[meta.word_offset..meta.word_offset + meta.num_words]
    }

    pub(crate) fn lock(&self) {
        self.lock.lock();
    }

    pub(crate) fn unlock(&self) {
        self.lock.unlock();
    }

    pub(crate) fn sink(&self) -> &dyn DiagSink {
        self.sink
    }

    pub fn contains(&self, ptr: usize) -> bool {
        ptr >= self.base && ptr < self.base + self.size as usize
    }
}

/// Consumes the heap. The engine owns no resources of its own to release —
/// the caller reclaims `base` and `bitfield` once this returns.
pub fn destroy(_heap: Heap<'_>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_main_size_region_seeds_one_entry() {
        let size = level_size(2); // exactly S2, no remainder
        let words = bitfield_words_for(size).unwrap();
        let mut bf = vec![0u32; words];
        let heap = Heap::create(0, size, &mut bf).unwrap();
        let i = crate::sizeclass::class_to_index(size);
        assert_eq!(heap.registry.next_nonempty_ge(0), Some(i));
    }

    #[test]
    fn composite_region_seeds_two_classes() {
        // 18 KiB region: one 16 KiB chunk (S2*4) and one 2 KiB chunk (S1*8).
        let size = 16384 + 2048;
        let base = level_size(2) as usize; // aligned to S2, the largest main size <= size
        let words = bitfield_words_for(size).unwrap();
        let mut bf = vec![0u32; words];
        let heap = Heap::create(base, size, &mut bf).unwrap();
        let i2 = crate::sizeclass::class_to_index(4 * level_size(2));
        let i1 = crate::sizeclass::class_to_index(8 * level_size(1));
        assert_eq!(heap.registry.next_nonempty_ge(i2), Some(i2));
        assert_eq!(heap.registry.next_nonempty_ge(i1), Some(i1));
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut bf = vec![0u32; 8];
        assert_eq!(Heap::create(0, 0, &mut bf).unwrap_err(), HeapError::InvalidHeapGeometry);
        assert_eq!(Heap::create(0, 17, &mut bf).unwrap_err(), HeapError::InvalidHeapGeometry);
        assert_eq!(Heap::create(1, 16, &mut bf).unwrap_err(), HeapError::InvalidHeapGeometry);
    }
}
