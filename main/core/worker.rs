//! The splice worker pool.
//!
//! Workers drain the active queue, shuttle bytes both directions for each
//! descriptor and stamp its activity time. They never touch the SYN table
//! and never destroy descriptors; terminal conditions are recorded on the
//! endpoints for the poller to act on when it reaps.

use crate::core::PepContext;

pub fn worker_loop(ctx: &PepContext) -> ! {
    ctx.queues.worker_loop(|proxy| {
        {
            let mut plane = proxy.plane();
            plane.splice_both();
        }
        proxy.touch_rxtx();
    })
}
