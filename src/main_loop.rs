//! Single-threaded event loop
//!
//! Every lifecycle operation runs here: proxy operations are futures polled
//! by a `LocalPool`, and deferred work (idle callbacks) is queued as ready
//! futures so that nothing recurses on the caller's stack.

use std::cell::RefCell;
use std::future::Future;

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;

pub struct MainLoop {
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoop {
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            pool: RefCell::new(pool),
            spawner,
        }
    }

    /// Queue a future; it first runs on the next loop iteration.
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        if let Err(e) = self.spawner.spawn_local(future) {
            log::error!("Failed to queue task on main loop: {}", e);
        }
    }

    /// Run `f` once from the loop instead of from the current stack.
    pub fn idle_add(&self, f: impl FnOnce() + 'static) {
        self.spawn_local(async move { f() });
    }

    /// Run every task that can make progress, including tasks queued while
    /// running, then return.
    pub fn run_until_stalled(&self) {
        match self.pool.try_borrow_mut() {
            Ok(mut pool) => pool.run_until_stalled(),
            Err(_) => log::warn!("run_until_stalled called from inside the main loop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_idle_runs_deferred_and_nested() {
        let main_loop = Rc::new(MainLoop::new());
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        let l = main_loop.clone();
        main_loop.idle_add(move || {
            h.set(h.get() + 1);
            let h2 = h.clone();
            l.idle_add(move || h2.set(h2.get() + 10));
        });
        assert_eq!(hits.get(), 0);

        main_loop.run_until_stalled();
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn test_pending_future_resumes_when_released() {
        let main_loop = MainLoop::new();
        let (tx, rx) = futures::channel::oneshot::channel::<u32>();
        let got = Rc::new(Cell::new(0));

        let g = got.clone();
        main_loop.spawn_local(async move {
            if let Ok(v) = rx.await {
                g.set(v);
            }
        });
        main_loop.run_until_stalled();
        assert_eq!(got.get(), 0);

        tx.send(7).unwrap();
        main_loop.run_until_stalled();
        assert_eq!(got.get(), 7);
    }
}
