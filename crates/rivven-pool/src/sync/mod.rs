//! Blocking primitives used by the pool

pub mod queue;
pub mod semaphore;

pub use queue::{BlockingQueue, BoundedBlockingQueue};
pub use semaphore::Semaphore;
