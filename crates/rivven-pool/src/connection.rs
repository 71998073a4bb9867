//! Pooled connections and the factory that creates them
//!
//! - [`ConnectionFactory`]: opens, checks and destroys raw resources
//! - [`Connection`]: lifecycle wrapper around one raw resource (owner
//!   tracking, validity, end-of-life)
//! - [`OwnerId`]: identity of the caller a connection is allocated to

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// Factory for the raw resources held by a pool
///
/// # Example
///
/// ```rust,ignore
/// struct TcpFactory { addr: String }
///
/// #[async_trait]
/// impl ConnectionFactory for TcpFactory {
///     type Resource = TcpStream;
///
///     async fn connect(&self, _config: &PoolConfig) -> Result<TcpStream> {
///         TcpStream::connect(&self.addr)
///             .await
///             .map_err(|e| Error::connection_with_source("connect failed", e))
///     }
///
///     async fn destroy(&self, _stream: &TcpStream) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Raw resource type handed to callers
    type Resource: Send + Sync + 'static;

    /// Open a new raw resource. Implementations should bound the time this takes.
    async fn connect(&self, config: &PoolConfig) -> Result<Self::Resource>;

    /// Check a resource. Only called when full validation is requested.
    async fn validate(&self, _resource: &Self::Resource) -> Result<()> {
        Ok(())
    }

    /// Destroy a resource. Errors are logged by the pool, never retried.
    async fn destroy(&self, resource: &Self::Resource) -> Result<()>;
}

/// Identity of a borrowing caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Wrap a raw identifier
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// A raw resource together with its pool bookkeeping
///
/// The pool moves a connection between the available queue, exactly one
/// owner, and the retirement queue. The connection itself only records who
/// owns it and whether it is still healthy; every state transition is driven
/// by the pool.
pub struct Connection<F: ConnectionFactory> {
    id: u64,
    factory: Arc<F>,
    resource: F::Resource,
    created_at: Instant,
    max_lifetime: Duration,
    validation_timeout: Duration,
    owner: Mutex<Option<OwnerId>>,
    last_error: Mutex<Option<String>>,
}

impl<F: ConnectionFactory> Connection<F> {
    /// Open a raw resource through the factory and wrap it.
    ///
    /// Any failure is reported as [`Error::Connection`].
    pub async fn open(id: u64, factory: Arc<F>, config: &PoolConfig) -> Result<Self> {
        let start = Instant::now();
        debug!(connection = id, "Connection attempting to open");

        match factory.connect(config).await {
            Ok(resource) => {
                debug!(
                    connection = id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Connection opened"
                );
                Ok(Self {
                    id,
                    factory,
                    resource,
                    created_at: Instant::now(),
                    max_lifetime: config.max_lifetime,
                    validation_timeout: config.effective_validation_timeout(),
                    owner: Mutex::new(None),
                    last_error: Mutex::new(None),
                })
            }
            Err(e) => {
                debug!(
                    connection = id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "Connection open attempt failed"
                );
                Err(match e {
                    e @ Error::Connection { .. } => e,
                    other => Error::connection_with_source("failed to open connection", other),
                })
            }
        }
    }

    /// Connection identifier, unique within its pool
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The raw resource. Errors from calls made this way are not captured;
    /// use [`call`](Self::call) for that.
    pub fn resource(&self) -> &F::Resource {
        &self.resource
    }

    /// Run an operation against the raw resource, recording any error on the
    /// connection so it is retired when it comes back to the pool.
    pub async fn call<'a, T, Fut, Op>(&'a self, op: Op) -> Result<T>
    where
        Op: FnOnce(&'a F::Resource) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = op(&self.resource).await;
        if let Err(e) = &result {
            self.capture_error(e);
        }
        result
    }

    /// Hand the connection to `owner`
    pub fn allocate(&self, owner: OwnerId) {
        *self.owner.lock() = Some(owner);
    }

    /// Take the connection back from `owner`.
    ///
    /// Fails if the connection is not allocated, or is allocated to someone else.
    pub fn release(&self, owner: OwnerId) -> Result<()> {
        let mut current = self.owner.lock();
        match *current {
            Some(holder) if holder == owner => {
                *current = None;
                Ok(())
            }
            Some(holder) => Err(Error::double_release(format!(
                "connection [{}] is owned by {}, not {}",
                self, holder, owner
            ))),
            None => Err(Error::double_release(format!(
                "connection [{}] has already been released; pass the connection between calls instead of borrowing twice",
                self
            ))),
        }
    }

    /// Current owner, if allocated
    pub fn owner(&self) -> Option<OwnerId> {
        *self.owner.lock()
    }

    /// Whether the connection is allocated to some caller
    pub fn is_allocated(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Whether the connection is still usable.
    ///
    /// A connection with a captured error is never valid. With `full_check`
    /// the factory checks the resource, bounded by the validation timeout; a
    /// failed or late check is captured as well.
    pub async fn is_valid(&self, full_check: bool) -> bool {
        if self.has_error() {
            return false;
        }
        if !full_check {
            return true;
        }

        match tokio::time::timeout(self.validation_timeout, self.factory.validate(&self.resource))
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.capture_error(&e);
                false
            }
            Err(_) => {
                self.capture_error(&Error::timeout(format!(
                    "validation exceeded {}ms",
                    self.validation_timeout.as_millis()
                )));
                false
            }
        }
    }

    /// Whether the connection has outlived the configured maximum lifetime
    pub fn is_end_of_life(&self) -> bool {
        !self.max_lifetime.is_zero() && self.created_at.elapsed() > self.max_lifetime
    }

    /// Time since the resource was opened
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Record an error; the connection is invalid from now on
    pub fn capture_error(&self, error: &dyn fmt::Display) {
        let message = error.to_string();
        debug!(connection = self.id, error = %message, "Connection captured error");
        *self.last_error.lock() = Some(message);
    }

    /// Whether an error has been captured
    pub fn has_error(&self) -> bool {
        self.last_error.lock().is_some()
    }

    /// Message of the most recently captured error
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Destroy the raw resource through the factory
    pub async fn close(&self) -> Result<()> {
        match self.factory.destroy(&self.resource).await {
            Ok(()) => {
                debug!(connection = self.id, "Connection closed");
                Ok(())
            }
            Err(e) => {
                warn!(connection = self.id, error = %e, "Connection close attempt failed");
                Err(e)
            }
        }
    }
}

impl<F: ConnectionFactory> fmt::Display for Connection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id={}", self.id)
    }
}

impl<F: ConnectionFactory> fmt::Debug for Connection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("age", &self.age())
            .field("owner", &self.owner())
            .field("last_error", &self.last_error())
            .finish()
    }
}
