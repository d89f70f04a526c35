//! Per-thread allocation accounting for leak tests.
//!
//! Installed as the global allocator of this crate's test binary. Counts are
//! kept per thread so tests running in parallel do not disturb each other.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

struct CountingAlloc;

thread_local! {
    static LIVE_BYTES: Cell<isize> = const { Cell::new(0) };
}

fn record(delta: isize) {
    // Ignore allocations made while the thread is being torn down.
    let _ = LIVE_BYTES.try_with(|c| c.set(c.get() + delta));
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        record(-(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new = System.realloc(ptr, layout, new_size);
        if !new.is_null() {
            record(new_size as isize - layout.size() as isize);
        }
        new
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

/// Bytes currently allocated by this thread.
pub fn live_bytes() -> isize {
    LIVE_BYTES.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::live_bytes;
    use crate::{fixtures, ModelFamily, ModelHandle};
    use crate::{Gpt2, Gpt2GraphParams, Gpt2Params, Magika, Yolo};
    use std::path::Path;

    /// Run init, one graph, and uninit; return the bytes left behind.
    fn cycle<F: ModelFamily>(path: &Path, params: &F::Params, gp: &F::GraphParams) -> isize {
        let before = live_bytes();
        let mut handle = ModelHandle::<F>::new();
        handle.init(path, params).unwrap();
        assert!(handle.is_live());
        handle.graph(gp).unwrap();
        handle.uninit();
        assert!(!handle.is_live());
        drop(handle);
        live_bytes() - before
    }

    fn assert_no_leak<F: ModelFamily>(path: &Path, params: &F::Params, gp: &F::GraphParams) {
        // The first cycle may register process-wide state such as log
        // callsites, which is never freed.
        cycle::<F>(path, params, gp);
        assert_eq!(cycle::<F>(path, params, gp), 0, "{} leaked", F::NAME);
    }

    #[test]
    fn test_gpt2_no_leak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpt2.bin");
        fixtures::write_gpt2(&path, &fixtures::tiny_gpt2_hparams(), false).unwrap();
        let gp = Gpt2GraphParams {
            n_past: 0,
            n_tokens: 2,
        };
        assert_no_leak::<Gpt2>(&path, &Gpt2Params::default(), &gp);
    }

    #[test]
    fn test_magika_no_leak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magika.gguf");
        fixtures::write_magika(&path).unwrap();
        assert_no_leak::<Magika>(&path, &Default::default(), &());
    }

    #[test]
    fn test_yolo_no_leak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yolo.gguf");
        fixtures::write_yolo(&path, Some((32, 32))).unwrap();
        assert_no_leak::<Yolo>(&path, &Default::default(), &());
    }

    #[test]
    fn test_failed_init_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.gguf");
        std::fs::write(&path, b"GGUF\x03\0\0\0truncated").unwrap();

        let attempt = || {
            let before = live_bytes();
            let mut handle = ModelHandle::<Magika>::new();
            assert!(handle.init(&path, &Default::default()).is_err());
            assert!(!handle.is_live());
            drop(handle);
            live_bytes() - before
        };
        attempt();
        assert_eq!(attempt(), 0);
    }
}
