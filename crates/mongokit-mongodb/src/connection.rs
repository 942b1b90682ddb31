//! MongoDB connection built from `ConnectOptions`, verified with a ping

use async_trait::async_trait;
use bson::{doc, Document as BsonDocument};
use mongodb::{
    options::{ClientOptions, ServerApi, ServerApiVersion},
    Client, Collection, Database,
};
use mongokit_common::{MongoKitError, Result};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::ConnectOptions;
use crate::manager::{Connector, ManagedConnection};

/// The driver rejects heartbeat frequencies below this value
const MIN_HEARTBEAT_FREQ: Duration = Duration::from_millis(500);

/// An open MongoDB client bound to the default database of its URI
#[derive(Debug, Clone)]
pub struct Connection {
    client: Client,
    database: Database,
    database_name: String,
}

impl Connection {
    /// Open a connection and wait until the server answers a ping
    #[instrument(skip(connection_string, options), fields(app_name = ?options.app_name))]
    pub async fn open(connection_string: &str, options: &ConnectOptions) -> Result<Self> {
        let mut client_options = ClientOptions::parse(connection_string)
            .await
            .map_err(|e| {
                let err = MongoKitError::from(e);
                if err.is_connection_refused() {
                    err
                } else {
                    MongoKitError::InvalidConfiguration(err.to_string())
                }
            })?;

        client_options.connect_timeout = Some(options.connect_timeout);
        client_options.server_selection_timeout = Some(options.connect_timeout);
        client_options.heartbeat_freq = Some(options.keep_alive.max(MIN_HEARTBEAT_FREQ));
        if let Some(app) = &options.app_name {
            client_options.app_name = Some(app.clone());
        }

        // Set stable API version for compatibility
        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options)?;

        let database = client.default_database().ok_or_else(|| {
            MongoKitError::InvalidConfiguration(
                "No default database specified in connection string".to_string(),
            )
        })?;
        let database_name = database.name().to_string();

        let connection = Self {
            client,
            database,
            database_name,
        };
        connection.ping().await?;
        debug!(database = %connection.database_name, "ping succeeded");

        Ok(connection)
    }

    /// Get a reference to the database
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Get the database name
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Get a reference to the client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get a collection by name (returns untyped BsonDocument collection)
    pub fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.database.collection(name)
    }

    /// Check that the server answers
    pub async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| match MongoKitError::from(e) {
                refused @ MongoKitError::ConnectionRefused(_) => refused,
                other => MongoKitError::Connection(format!("Ping failed: {}", other)),
            })?;
        Ok(())
    }

    /// List all collection names in the current database, system collections included
    pub async fn list_collection_names(&self) -> Result<Vec<String>> {
        let names = self.database.list_collection_names().await?;
        Ok(names)
    }
}

#[async_trait]
impl ManagedConnection for Connection {
    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// Opens [`Connection`]s for a [`ConnectionManager`](crate::ConnectionManager)
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoConnector;

#[async_trait]
impl Connector for MongoConnector {
    type Connection = Connection;

    async fn connect(&self, uri: &str, options: &ConnectOptions) -> Result<Connection> {
        Connection::open(uri, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uri_without_database_is_invalid_configuration() {
        // Parsing a plain host URI needs no server; the missing database is
        // detected before any network round trip.
        let options = ConnectOptions::default();
        let err = Connection::open("mongodb://localhost:27017", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, MongoKitError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_malformed_uri_is_invalid_configuration() {
        let err = Connection::open("not-a-uri", &ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MongoKitError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    #[ignore] // Requires MONGO_TEST_CONNECTION_STRING pointing at a running server
    async fn test_open_and_ping() {
        let uri = std::env::var("MONGO_TEST_CONNECTION_STRING")
            .unwrap_or_else(|_| "mongodb://localhost:27017/mongokit_test".to_string());
        let conn = Connection::open(&uri, &ConnectOptions::default()).await.unwrap();
        conn.ping().await.unwrap();
        conn.close().await.unwrap();
    }
}
