//! # rivven-pool
//!
//! Adaptive, self-sizing connection pooling for the Rivven event streaming platform.
//!
//! The pool keeps a low-water mark of connections open, grows on demand up to
//! a high-water mark, retires idle connections after a period of inactivity,
//! and backs off when the connection factory keeps failing. Borrowing and
//! returning never contend on a pool-wide lock.
//!
//! ## Features
//!
//! - **Demand-driven growth**: borrowers that find the pool empty signal a
//!   background task that opens connections, with exponential backoff on failure
//! - **Peak-aware pruning**: idle connections above `max(min, recent peak)` are
//!   retired periodically
//! - **Session affinity**: a session reuses the connection it already holds
//! - **Ownership checks**: returning a connection the caller does not own fails
//!   without disturbing the pool
//! - **Validation**: connections that captured an error, failed a check or
//!   outlived their maximum lifetime are retired instead of reused
//! - **Sync primitives**: a coalescing semaphore and blocking queues built on it
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_pool::prelude::*;
//!
//! let config = PoolConfig::builder()
//!     .min_connections(2)
//!     .max_connections(10)
//!     .connection_timeout(Duration::from_secs(5))
//!     .build()?;
//!
//! let manager = ConnectionManager::new(config, Arc::new(MyFactory::new()));
//!
//! let mut session = manager.session().await?;
//! let conn = manager.get_connection(&mut session).await?;
//! conn.call(|raw| async move { raw.send(b"ping").await }).await?;
//! manager.release_connection(&mut session, conn).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod pool;
pub mod sync;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Configuration
    pub use crate::config::{PoolBuilder, PoolConfig};

    // Connection traits and wrappers
    pub use crate::connection::{Connection, ConnectionFactory, OwnerId};

    // Pool types
    pub use crate::manager::ConnectionManager;
    pub use crate::pool::{AtomicPoolStats, ConnectionPool, PoolStats, Session};

    // Sync primitives
    pub use crate::sync::{BlockingQueue, BoundedBlockingQueue, Semaphore};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
