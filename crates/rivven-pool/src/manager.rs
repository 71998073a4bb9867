//! Lazily-initialized pool front end
//!
//! [`ConnectionManager`] owns one [`ConnectionPool`] and creates it on first
//! use, so holding a manager costs nothing until a caller actually needs a
//! connection. Each borrow logs the pool's occupancy at debug level.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionFactory};
use crate::error::Result;
use crate::pool::{ConnectionPool, Session};

/// Creates a pool on first use and hands out connections from it
pub struct ConnectionManager<F: ConnectionFactory> {
    config: PoolConfig,
    factory: Arc<F>,
    pool: OnceCell<ConnectionPool<F>>,
}

impl<F: ConnectionFactory> ConnectionManager<F> {
    /// Create a manager. The pool is not created until first use.
    pub fn new(config: PoolConfig, factory: Arc<F>) -> Self {
        Self {
            config,
            factory,
            pool: OnceCell::new(),
        }
    }

    /// The pool, creating it if needed. Concurrent first callers share one
    /// initialization.
    pub async fn pool(&self) -> Result<&ConnectionPool<F>> {
        self.pool
            .get_or_try_init(|| async {
                ConnectionPool::new(self.config.clone(), Arc::clone(&self.factory))
            })
            .await
    }

    /// Whether the pool has been created yet
    pub fn is_initialized(&self) -> bool {
        self.pool.initialized()
    }

    /// Open a borrowing context on the managed pool
    pub async fn session(&self) -> Result<Session<F>> {
        Ok(self.pool().await?.session())
    }

    /// Borrow a connection, logging pool occupancy first
    pub async fn get_connection(&self, session: &mut Session<F>) -> Result<Arc<Connection<F>>> {
        let pool = self.pool().await?;
        debug!(
            pool = %pool.id(),
            total = pool.total_connections(),
            active = pool.active_connections(),
            deficit = pool.connection_deficit(),
            churn = pool.churned_connections(),
            "Connection pool occupancy"
        );
        pool.get_connection(session).await
    }

    /// Return a connection to the managed pool
    pub async fn release_connection(
        &self,
        session: &mut Session<F>,
        conn: Arc<Connection<F>>,
    ) -> Result<()> {
        self.pool().await?.release_connection(session, conn).await
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("pool", &self.pool.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        type Resource = usize;

        async fn connect(&self, _config: &PoolConfig) -> Result<usize> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _resource: &usize) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pool_created_on_first_use() {
        let factory = Arc::new(CountingFactory::default());
        let manager = ConnectionManager::new(PoolConfig::default(), factory.clone());
        assert!(!manager.is_initialized());

        let mut session = manager.session().await.unwrap();
        assert!(manager.is_initialized());

        let conn = manager.get_connection(&mut session).await.unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        manager.release_connection(&mut session, conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_surfaces_on_first_use() {
        let manager = ConnectionManager::new(
            PoolConfig::new()
                .with_min_connections(5)
                .with_max_connections(2),
            Arc::new(CountingFactory::default()),
        );

        let err = manager.session().await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!manager.is_initialized());
    }
}
