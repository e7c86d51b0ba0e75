// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use anyhow::anyhow;
use diesel::migration::{Migration, MigrationSource, MigrationVersion};
use diesel::pg::Pg;
use diesel::ConnectionError;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::ManagerConfig;
use diesel_async::{
    pooled_connection::{
        bb8::{Pool, PooledConnection},
        AsyncDieselConnectionManager,
    },
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use diesel_migrations::EmbeddedMigrations;
use futures::FutureExt;
use tracing::info;
use url::Url;

#[derive(clap::Args, Debug, Clone)]
pub struct DbArgs {
    // Number of connections to keep in the pool.
    #[arg(long, env, default_value_t = Self::default().db_connection_pool_size)]
    pub db_connection_pool_size: u32,

    // Time spent waiting for a connection from the pool to become available, in milliseconds.
    #[arg(long, env, default_value_t = Self::default().db_connection_timeout_ms)]
    pub db_connection_timeout_ms: u64,

    #[arg(long, env)]
    // Time spent waiting for statements to complete, in milliseconds.
    pub db_statement_timeout_ms: Option<u64>,
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
    database_url: String,
}

// Wrapper struct over the remote `PooledConnection` type so stores can hold a connection without
// naming the pool types.
pub struct Connection<'a>(PooledConnection<'a, AsyncPgConnection>);

impl DbArgs {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connection_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.db_statement_timeout_ms.map(Duration::from_millis)
    }
}

impl Db {
    // Construct a new DB connection pool talking to the database at `database_url` that supports
    // write and reads. Instances of [Db] can be cloned to share access to the same pool.
    pub async fn for_write(database_url: Url, config: DbArgs) -> anyhow::Result<Self> {
        let pool = pool(database_url.clone(), config).await?;
        Ok(Self {
            pool,
            database_url: database_url.to_string(),
        })
    }

    // Retrieves a connection from the pool. Can fail with a timeout if a connection cannot be
    // established before the [DbArgs::connection_timeout] has elapsed.
    pub async fn connect(&self) -> anyhow::Result<Connection<'_>> {
        Ok(Connection(self.pool.get().await?))
    }

    async fn clear_database(&self) -> anyhow::Result<()> {
        info!("Clearing the database...");
        let mut conn = self.connect().await?;
        let drop_all_tables = "
        DO $$ DECLARE
            r RECORD;
        BEGIN
        FOR r IN (SELECT tablename FROM pg_tables WHERE schemaname = 'public')
            LOOP
                EXECUTE 'DROP TABLE IF EXISTS ' || quote_ident(r.tablename) || ' CASCADE';
            END LOOP;
        END $$;";
        diesel::sql_query(drop_all_tables)
            .execute(&mut conn)
            .await?;
        info!("Database cleared.");
        Ok(())
    }

    // Run the given embedded migrations on the database. The schema crate exposes its
    // `MIGRATIONS` constant for this.
    pub async fn run_migrations(
        &self,
        migrations: &'static EmbeddedMigrations,
    ) -> anyhow::Result<Vec<MigrationVersion<'static>>> {
        use diesel_migrations::MigrationHarness;

        info!("Running migrations ...");
        let conn = AsyncPgConnection::establish(&self.database_url)
            .await
            .map_err(|e| anyhow!("Failed to establish connection for migrations: {}", e))?;
        let mut wrapper: AsyncConnectionWrapper<AsyncPgConnection> = conn.into();

        let finished_migrations = tokio::task::spawn_blocking(move || {
            wrapper
                .run_pending_migrations(EmbeddedSource(migrations))
                .map(|versions| versions.iter().map(MigrationVersion::as_owned).collect())
        })
        .await?
        .map_err(|e| anyhow!("Failed to run migrations: {:?}", e))?;

        info!("Migrations complete.");
        Ok(finished_migrations)
    }
}

impl Default for DbArgs {
    fn default() -> Self {
        Self {
            db_connection_pool_size: 20,
            db_connection_timeout_ms: 30_000,
            db_statement_timeout_ms: None,
        }
    }
}

// Drop all tables, and re-run migrations if supplied.
pub async fn reset_database(
    database_url: Url,
    db_config: DbArgs,
    migrations: Option<&'static EmbeddedMigrations>,
) -> anyhow::Result<()> {
    let db = Db::for_write(database_url, db_config).await?;
    db.clear_database().await?;
    if let Some(migrations) = migrations {
        db.run_migrations(migrations).await?;
    }

    Ok(())
}

impl<'a> Deref for Connection<'a> {
    type Target = PooledConnection<'a, AsyncPgConnection>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

async fn pool(database_url: Url, args: DbArgs) -> anyhow::Result<Pool<AsyncPgConnection>> {
    let statement_timeout = args.statement_timeout();

    let mut config = ManagerConfig::default();

    config.custom_setup = Box::new(move |url| {
        async move {
            let mut conn = AsyncPgConnection::establish(url).await?;

            if let Some(timeout) = statement_timeout {
                diesel::sql_query(format!("SET statement_timeout = {}", timeout.as_millis()))
                    .execute(&mut conn)
                    .await
                    .map_err(ConnectionError::CouldntSetupConfiguration)?;
            }

            Ok(conn)
        }
        .boxed()
    });

    let manager = AsyncDieselConnectionManager::new_with_config(database_url.as_str(), config);

    Ok(Pool::builder()
        .max_size(args.db_connection_pool_size)
        .connection_timeout(args.connection_timeout())
        .build(manager)
        .await?)
}

// Adapts a `&'static EmbeddedMigrations` into an owned migration source for the harness.
struct EmbeddedSource(&'static EmbeddedMigrations);

impl MigrationSource<Pg> for EmbeddedSource {
    fn migrations(&self) -> diesel::migration::Result<Vec<Box<dyn Migration<Pg>>>> {
        self.0.migrations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::prelude::QueryableByName;

    #[derive(Debug, QueryableByName)]
    struct CountResult {
        #[diesel(sql_type = diesel::sql_types::BigInt)]
        cnt: i64,
    }

    #[test]
    fn test_db_args_defaults() {
        let args = DbArgs::default();
        assert_eq!(args.db_connection_pool_size, 20);
        assert_eq!(args.connection_timeout(), Duration::from_secs(30));
        assert_eq!(args.statement_timeout(), None);
    }

    #[test]
    fn test_statement_timeout_conversion() {
        let args = DbArgs {
            db_statement_timeout_ms: Some(1500),
            ..Default::default()
        };
        assert_eq!(args.statement_timeout(), Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn test_round_trip_query() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let database_url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set");
        let url: Url = database_url.parse().expect("Invalid database URL format");

        let db = Db::for_write(url, DbArgs::default())
            .await
            .expect("Failed to connect to database");
        let mut conn = db.connect().await.expect("Failed to get connection from pool");
        let result: CountResult = diesel::sql_query("SELECT 1::BIGINT AS cnt")
            .get_result(&mut conn)
            .await
            .expect("Failed to execute query");

        assert_eq!(result.cnt, 1);
    }
}
