//! The active/ready work-queue pair connecting the poller to the worker
//! pool.
//!
//! The two queues form a barrier. The poller pushes a batch of ready
//! descriptors onto *active*, and acquires the *ready* lock before waking
//! the workers so their completion signal cannot fire before it is
//! waiting for it. Workers drain *active* (releasing its lock only around
//! the splice work), park their finished descriptors on a local list and
//! transfer it to *ready* in one step. The poller's dispatch returns once
//! *ready* holds exactly the batch it submitted — a short return is a
//! programming error.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::proxy::Proxy;

pub struct WorkQueues {
    active: Mutex<VecDeque<Arc<Proxy>>>,
    active_cond: Condvar,
    ready: Mutex<VecDeque<Arc<Proxy>>>,
    ready_cond: Condvar,
}

impl WorkQueues {
    pub fn new() -> WorkQueues {
        WorkQueues {
            active: Mutex::new(VecDeque::new()),
            active_cond: Condvar::new(),
            ready: Mutex::new(VecDeque::new()),
            ready_cond: Condvar::new(),
        }
    }

    /// Poller side: hand `batch` to the workers and block until every one
    /// of them has been worked and returned.
    pub fn dispatch_and_wait(&self, batch: Vec<Arc<Proxy>>) -> Vec<Arc<Proxy>> {
        let num_works = batch.len();

        let mut active = self.active.lock().unwrap();
        active.extend(batch);

        // Take the ready lock before waking the workers; a worker that
        // finishes instantly then blocks on ready until we are waiting.
        let mut ready = self.ready.lock().unwrap();
        self.active_cond.notify_all();
        drop(active);

        while ready.len() != num_works {
            assert!(
                ready.len() < num_works,
                "workers returned more descriptors than were dispatched"
            );
            ready = self.ready_cond.wait(ready).unwrap();
        }

        ready.drain(..).collect()
    }

    /// Worker side: run forever, applying `work` to each descriptor taken
    /// from the active queue. The active lock is held except while `work`
    /// runs, so a wake can never be lost between the drain and the wait.
    pub fn worker_loop<F: FnMut(&Arc<Proxy>)>(&self, mut work: F) -> ! {
        let mut active = self.active.lock().unwrap();
        loop {
            while active.is_empty() {
                active = self.active_cond.wait(active).unwrap();
            }

            let mut done: Vec<Arc<Proxy>> = Vec::new();
            while let Some(proxy) = active.pop_front() {
                drop(active);
                work(&proxy);
                done.push(proxy);
                active = self.active.lock().unwrap();
            }

            if !done.is_empty() {
                let mut ready = self.ready.lock().unwrap();
                ready.extend(done);
                self.ready_cond.notify_all();
            }
        }
    }
}

impl Default for WorkQueues {
    fn default() -> Self {
        WorkQueues::new()
    }
}
