/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use crate::bitfield::{self, Status};
use crate::defines::{level_size, GROUP, MIN_ALIGN};
use crate::diag;
use crate::errors::HeapError;
use crate::heap::Heap;
use crate::sizeclass::{class_to_index, index_to_class, level_of_class, round_up_to_class};

fn mult_of_class(level: usize, class: u32) -> usize {
    (class >> (4 * (level as u32 + 1))) as usize
}

impl<'a> Heap<'a> {
    /// Reserve a contiguous, 16-aligned block of at least `request_bytes`.
    /// Always grants exactly `round_up_to_class(request_bytes)` bytes.
    pub fn alloc(&mut self, request_bytes: u32) -> Result<usize, HeapError> {
        self.lock();
        let result = self.alloc_inner(request_bytes);
        self.unlock();
        result
    }

    fn alloc_inner(&mut self, request_bytes: u32) -> Result<usize, HeapError> {
        if request_bytes == 0 {
            diag!(self.sink(), crate::debug::INFO, "alloc(0) rejected\n");
            return Err(HeapError::OutOfMemory);
        }
        let target_class = round_up_to_class(request_bytes).ok_or(HeapError::OutOfMemory)?;
        let i_star = class_to_index(target_class);
        let i = self
            .registry
            .next_nonempty_ge(i_star)
            .ok_or(HeapError::OutOfMemory)?;

        let found_class = index_to_class(i);
        let found_level = level_of_class(found_class);
        let found_mult = mult_of_class(found_level, found_class);
        let addr = self
            .registry
            .pop_head(i)
            .expect("occupancy bit guarantees a head at this index");

        let target_level = level_of_class(target_class);
        let target_mult = mult_of_class(target_level, target_class);

        Ok(self.place(found_level, addr, found_mult, target_level, target_mult))
    }

    /// Carve `target_mult` chunks of `target_level` out of a FREE run of
    /// `avail_mult` chunks at `level` starting at `addr`. Splits one level
    /// at a time, pushing back whatever isn't consumed, until it reaches the
    /// target's own level.
    fn place(
        &mut self,
        level: usize,
        addr: usize,
        avail_mult: usize,
        target_level: usize,
        target_mult: usize,
    ) -> usize {
        if level == target_level {
            if avail_mult > target_mult {
                let sk = level_size(level) as usize;
                self.push_free_run(level, addr + target_mult * sk, avail_mult - target_mult);
            }
            self.mark_allocated(level, addr, target_mult);
            return addr;
        }
        if avail_mult > 1 {
            let sk = level_size(level) as usize;
            self.push_free_run(level, addr + sk, avail_mult - 1);
        }
        let idx = self.chunk_index(level, addr);
        bitfield::set_one(self.words_mut(level), idx, Status::Split);
        self.place(level - 1, addr, GROUP, target_level, target_mult)
    }

    fn mark_allocated(&mut self, level: usize, addr: usize, mult: usize) {
        let idx = self.chunk_index(level, addr);
        bitfield::set_one(self.words_mut(level), idx, Status::AllocHead);
        if mult > 1 {
            bitfield::set_run(self.words_mut(level), idx + 1, mult - 1, Status::Alloc);
        }
    }

    fn push_free_run(&mut self, level: usize, addr: usize, mult: usize) {
        let idx = self.chunk_index(level, addr);
        bitfield::set_run(self.words_mut(level), idx, mult, Status::Free);
        self.registry.push_head(15 * level + mult - 1, addr);
    }

    /// Release a previously granted block. `ptr == 0` (null) is a no-op.
    pub fn free(&mut self, ptr: usize) -> Result<(), HeapError> {
        if ptr == 0 {
            return Ok(());
        }
        self.lock();
        let result = self.free_inner(ptr);
        self.unlock();
        result
    }

    fn free_inner(&mut self, ptr: usize) -> Result<(), HeapError> {
        match self.locate_alloc(ptr) {
            Some((level, mult)) => {
                self.release_run(level, ptr, mult);
                Ok(())
            }
            None => {
                diag!(self.sink(), crate::debug::CRITICAL, "free: unknown address\n");
                Err(HeapError::UnknownAddress)
            }
        }
    }

    /// Fold a just-freed run with its same-level neighbors, promoting a
    /// fully-reassembled 16-chunk group into its parent's single FREE chunk.
    fn release_run(&mut self, level: usize, addr: usize, cnt: usize) {
        let idx = self.chunk_index(level, addr);
        let sub = idx % GROUP;
        let sk = level_size(level) as usize;

        let prev_cnt = if sub == 0 {
            0
        } else {
            bitfield::trailing_run(self.words(level), idx, Status::Free)
        };
        let next_cnt = if sub + cnt >= GROUP {
            0
        } else {
            bitfield::leading_run(self.words(level), idx + cnt, Status::Free)
        };

        if prev_cnt > 0 {
            self.registry.remove(15 * level + prev_cnt - 1, addr - prev_cnt * sk);
        }
        if next_cnt > 0 {
            self.registry.remove(15 * level + next_cnt - 1, addr + cnt * sk);
        }

        let merged_cnt = prev_cnt + cnt + next_cnt;
        let merged_addr = addr - prev_cnt * sk;

        debug_assert!(merged_cnt <= GROUP);
        if merged_cnt == GROUP && level < self.top {
            let merged_idx = self.chunk_index(level, merged_addr);
            bitfield::set_run(self.words_mut(level), merged_idx, merged_cnt, Status::Free);
            let parent_idx = self.chunk_index(level + 1, merged_addr);
            bitfield::set_one(self.words_mut(level + 1), parent_idx, Status::Free);
            self.release_run(level + 1, merged_addr, 1);
        } else {
            self.push_free_run(level, merged_addr, merged_cnt);
        }
    }

    /// Size actually granted for `ptr`, or 0 if `ptr` isn't a live
    /// allocation head.
    pub fn alloc_size_of(&self, ptr: usize) -> u32 {
        match self.locate_alloc(ptr) {
            Some((level, mult)) => mult as u32 * level_size(level),
            None => 0,
        }
    }

    /// Debug-only per-address status, following SPLIT chunks down to
    /// wherever the address is actually accounted for.
    #[cfg(any(test, debug_assertions))]
    pub fn status_of(&self, ptr: usize) -> Option<Status> {
        if !self.contains(ptr) || ptr % MIN_ALIGN as usize != 0 {
            return None;
        }
        let mut level = self.coarsest_possible_level(ptr);
        loop {
            let idx = self.chunk_index(level, ptr);
            let status = bitfield::get(self.words(level), idx);
            if status == Status::Split && level > 0 {
                level -= 1;
                continue;
            }
            return Some(status);
        }
    }

    fn locate_alloc(&self, ptr: usize) -> Option<(usize, usize)> {
        if !self.contains(ptr) || ptr % MIN_ALIGN as usize != 0 {
            return None;
        }
        let k0 = self.coarsest_possible_level(ptr);
        for level in (0..=k0).rev() {
            let idx = self.chunk_index(level, ptr);
            if bitfield::get(self.words(level), idx) == Status::AllocHead {
                let sub = idx % GROUP;
                let additional = if sub == GROUP - 1 {
                    0
                } else {
                    bitfield::leading_run(self.words(level), idx + 1, Status::Alloc)
                };
                return Some((level, 1 + additional));
            }
        }
        None
    }

    /// The coarsest level `ptr` could possibly be a head of, from its own
    /// alignment. Descending from here guarantees every level visited still
    /// has `ptr` at that level's own aligned boundary.
    fn coarsest_possible_level(&self, ptr: usize) -> usize {
        let diff = ptr - self.base;
        if diff == 0 {
            return self.top;
        }
        let tz = diff.trailing_zeros();
        ((tz / 4).saturating_sub(1) as usize).min(self.top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defines::MAX_CLASS;

    // Address 0 doubles as the null sentinel `alloc`/`free` use, so no heap
    // under test is based there — real embedders never map memory at the
    // null page either. `level_size(LEVELS-1)` is aligned for every level.
    const BASE: usize = level_size(crate::defines::LEVELS - 1) as usize;

    fn new_heap(size: u32) -> (Vec<u32>, usize) {
        let words = crate::heap::bitfield_words_for(size).unwrap();
        (vec![0u32; words], words)
    }

    #[test]
    fn alloc_then_free_then_alloc_whole_heap() {
        let size = level_size(2) * 15; // 15*S2, a single main-size multiple
        let (mut bf, _) = new_heap(size);
        let mut heap = Heap::create(BASE, size, &mut bf).unwrap();

        let p1 = heap.alloc(16 + 256 + 4096).unwrap();
        let p2 = heap.alloc(16).unwrap();
        assert_ne!(p1, p2);
        heap.free(p1).unwrap();
        heap.free(p2).unwrap();
        assert!(heap.alloc(size).is_ok());
    }

    #[test]
    fn granted_size_is_always_a_class_value() {
        let size = level_size(3); // S3, plenty of room
        let (mut bf, _) = new_heap(size);
        let mut heap = Heap::create(BASE, size, &mut bf).unwrap();

        let p = heap.alloc(345).unwrap();
        assert_eq!(p % 16, 0);
        let granted = heap.alloc_size_of(p);
        assert_eq!(granted, 512);
        assert!(crate::sizeclass::is_class(granted));
    }

    #[test]
    fn free_round_trips_to_free_status() {
        let size = level_size(2);
        let (mut bf, _) = new_heap(size);
        let mut heap = Heap::create(BASE, size, &mut bf).unwrap();

        let p = heap.alloc(100).unwrap();
        heap.free(p).unwrap();
        assert_eq!(heap.status_of(p), Some(Status::Free));
    }

    #[test]
    fn boundary_cases() {
        let size = level_size(2);
        let (mut bf, _) = new_heap(size);
        let mut heap = Heap::create(BASE, size, &mut bf).unwrap();

        assert_eq!(heap.alloc(0), Err(HeapError::OutOfMemory));
        assert_eq!(heap.alloc(size + 1), Err(HeapError::OutOfMemory));
        assert_eq!(heap.free(0), Ok(()));
        assert_eq!(heap.free(1), Err(HeapError::UnknownAddress));
        assert_eq!(heap.alloc(MAX_CLASS + 1), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn last_slot_then_exhausted() {
        let size = MIN_ALIGN;
        let (mut bf, _) = new_heap(size);
        let mut heap = Heap::create(BASE, size, &mut bf).unwrap();

        let p = heap.alloc(16).unwrap();
        assert_eq!(heap.alloc(16), Err(HeapError::OutOfMemory));
        heap.free(p).unwrap();
        assert!(heap.alloc(16).is_ok());
    }

    #[test]
    fn split_and_merge_across_levels_restores_single_free_chunk() {
        let size = level_size(2); // one S2 chunk, must split down to grant S0/S1 sizes
        let (mut bf, _) = new_heap(size);
        let mut heap = Heap::create(BASE, size, &mut bf).unwrap();

        let mut ptrs = Vec::new();
        let mut remaining = size;
        while remaining >= 16 {
            match heap.alloc(16) {
                Ok(p) => {
                    ptrs.push(p);
                    remaining -= 16;
                }
                Err(_) => break,
            }
        }
        assert!(heap.alloc(16).is_err());
        for p in ptrs {
            heap.free(p).unwrap();
            assert_eq!(heap.status_of(p), Some(Status::Free));
        }
        assert!(heap.alloc(size).is_ok());
    }

    /// Freeing an entire 16-chunk group one chunk at a time, in increasing
    /// address order, must promote cleanly into the parent's single FREE
    /// chunk: the last chunk freed (the one whose own merge completes the
    /// full group) must itself read back as FREE afterward, not a stale
    /// AllocHead left over from before the merge, and freeing it again must
    /// be rejected rather than silently corrupting the free list.
    #[test]
    fn full_group_merge_leaves_every_chunk_free_and_rejects_double_free() {
        let size = level_size(1); // one S1 region: exactly 16 S0 chunks
        let (mut bf, _) = new_heap(size);
        let mut heap = Heap::create(BASE, size, &mut bf).unwrap();

        let mut ptrs = Vec::new();
        for _ in 0..16 {
            ptrs.push(heap.alloc(16).unwrap());
        }
        ptrs.sort_unstable();

        for &p in &ptrs {
            heap.free(p).unwrap();
            assert_eq!(heap.status_of(p), Some(Status::Free), "addr {p:#x} stale after free");
        }
        let last = *ptrs.last().unwrap();
        assert_eq!(heap.free(last), Err(HeapError::UnknownAddress));
        assert!(heap.alloc(size).is_ok());
    }
}
