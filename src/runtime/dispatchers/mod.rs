//! Dispatcher loops for the runtime:
//! - `orchestration`: locks instance batches and runs replay turns
//! - `worker`: executes activities off the worker queue

mod orchestration;
mod worker;
