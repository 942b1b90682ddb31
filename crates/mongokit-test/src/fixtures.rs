//! Database fixture for test suites
//!
//! Wraps a [`ConnectionManager`] and a [`ResetEngine`] so a suite can empty
//! the test database between cases. When a reset exhausts its retry budget
//! the fixture hands the error to an [`ExitHandler`], which for a real run
//! terminates the process: a database that cannot be cleared leaves every
//! later test running against stale data.

use mongokit_mongodb::{
    ConnectionManager, Connector, DatabaseConfig, Environment, MongoKitError, ResetEngine,
    ResetReport, ResettableStore, Result, RetryPolicy,
};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Decides what happens when a reset cannot complete
pub trait ExitHandler: Send + Sync {
    fn terminate(&self, error: &MongoKitError);
}

/// Logs the failure and exits the process with status 1
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl ExitHandler for ProcessExit {
    fn terminate(&self, err: &MongoKitError) {
        error!(error = %err, "test database could not be reset, exiting");
        std::process::exit(1);
    }
}

/// Connection plus reset policy for a test database
pub struct DatabaseFixture<C: Connector> {
    manager: ConnectionManager<C>,
    policy: RetryPolicy,
    exit: Arc<dyn ExitHandler>,
}

impl<C: Connector> fmt::Debug for DatabaseFixture<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseFixture")
            .field("manager", &self.manager)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<C> DatabaseFixture<C>
where
    C: Connector,
    C::Connection: ResettableStore,
{
    /// Wrap an existing manager (initialized or not)
    pub fn new(manager: ConnectionManager<C>, exit: Arc<dyn ExitHandler>) -> Self {
        Self {
            manager,
            policy: RetryPolicy::default(),
            exit,
        }
    }

    /// Create a manager for `connector` and start connecting with `config`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn from_config(
        connector: C,
        config: &DatabaseConfig,
        exit: Arc<dyn ExitHandler>,
    ) -> Result<Self> {
        let manager = ConnectionManager::new(connector);
        manager.init_connection(&config.uri, &config.overrides)?;
        Ok(Self::new(manager, exit))
    }

    /// [`from_config`](Self::from_config) with settings read from the process environment
    pub fn from_env(
        connector: C,
        environment: Environment,
        exit: Arc<dyn ExitHandler>,
    ) -> Result<Self> {
        let config = DatabaseConfig::from_env(environment)?;
        Self::from_config(connector, &config, exit)
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wait for the connection to open
    pub async fn connection(&self) -> Result<Arc<C::Connection>> {
        self.manager.get_connection().await
    }

    /// Delete every document in every user collection
    pub async fn clear_collections(&self) -> Result<ResetReport> {
        let engine = self.engine().await?;
        let result = engine.reset_all_data().await;
        self.finish(result)
    }

    /// Drop every non-`_id` index in every user collection
    pub async fn clear_indexes(&self) -> Result<ResetReport> {
        let engine = self.engine().await?;
        let result = engine.reset_all_indexes().await;
        self.finish(result)
    }

    /// Close the connection; failures are logged, never returned
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    async fn engine(&self) -> Result<ResetEngine<C::Connection>> {
        let store = self.manager.get_connection().await?;
        Ok(ResetEngine::with_policy(store, self.policy.clone()))
    }

    fn finish(&self, result: Result<ResetReport>) -> Result<ResetReport> {
        match &result {
            Ok(report) => info!(
                collections = report.collections.len(),
                documents_deleted = report.documents_deleted,
                "test database reset"
            ),
            Err(err @ MongoKitError::RetryExhausted { .. }) => self.exit.terminate(err),
            Err(_) => {}
        }
        result
    }
}
