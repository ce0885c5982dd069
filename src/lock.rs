/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::sync::atomic::{AtomicU32, Ordering};

/// Bracketed around each `alloc`/`free` body. The engine itself never
/// serializes internally; an embedder sharing one `Heap` across threads
/// supplies a hook that does.
pub trait LockHook {
    fn lock(&self);
    fn unlock(&self);
}

/// Default hook: single-threaded embedders pay nothing.
pub struct NullLock;

impl LockHook for NullLock {
    fn lock(&self) {}
    fn unlock(&self) {}
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A bare test-and-test-and-set spinlock, suitable for bracketing `alloc`/
/// `free` without depending on an allocating mutex implementation.
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl LockHook for SpinLock {
    fn lock(&self) {
        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.state.load(Ordering::Relaxed) == LOCKED {
                core::hint::spin_loop();
            }
        }
    }

    fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}
