// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Scoped pause of the GPU thread.

use crate::thread::GpuThread;

/// Holds the GPU thread paused for the guard's lifetime.
///
/// Taken on the GPU thread itself the guard does nothing.
#[must_use = "the GPU thread resumes as soon as the guard is dropped"]
pub struct EngineLock<'a> {
    thread: Option<&'a dyn GpuThread>,
}

impl<'a> EngineLock<'a> {
    pub fn new(thread: &'a dyn GpuThread) -> Self {
        if thread.is_current_thread() {
            return Self { thread: None };
        }
        thread.pause();
        Self {
            thread: Some(thread),
        }
    }

    /// True if this guard actually paused the GPU thread.
    pub fn is_active(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for EngineLock<'_> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.unpause();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::RsxThread;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_noop_on_gpu_thread() {
        let gpu = RsxThread::new();
        gpu.bind_current();
        let lock = EngineLock::new(&gpu);
        assert!(!lock.is_active());
        drop(lock);
        gpu.unbind();
    }

    #[test]
    fn test_pauses_from_other_thread() {
        let gpu = Arc::new(RsxThread::new());
        let ready = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let gpu = gpu.clone();
            let ready = ready.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                gpu.bind_current();
                ready.store(true, Ordering::SeqCst);
                while !stop.load(Ordering::SeqCst) && gpu.check_state() {
                    thread::yield_now();
                }
                gpu.unbind();
            })
        };
        while !ready.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        {
            let lock = EngineLock::new(gpu.as_ref());
            assert!(lock.is_active());
            assert!(gpu.is_paused());
        }

        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        assert!(!gpu.is_paused());
    }
}
