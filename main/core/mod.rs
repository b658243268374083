pub mod configuration;
pub mod listener;
pub mod logger;
pub mod main;
pub mod poller;
pub mod status;
pub mod timer;
pub mod worker;

use std::io;
use std::sync::Arc;

use crate::core::configuration::Config;
use crate::proxy::queue::WorkQueues;
use crate::proxy::syn_table::SynTable;
use crate::utility::waker::PollWaker;

/// State shared by the listener, poller, worker and timer threads.
pub struct PepContext {
    pub config: Config,
    pub table: SynTable,
    pub queues: WorkQueues,
    pub waker: PollWaker,
}

impl PepContext {
    pub fn new(config: Config) -> io::Result<Arc<PepContext>> {
        let table = SynTable::new(config.max_conns);
        Ok(Arc::new(PepContext {
            config,
            table,
            queues: WorkQueues::new(),
            waker: PollWaker::new()?,
        }))
    }
}
