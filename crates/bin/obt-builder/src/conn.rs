//! The single database session a build runs on

use sqlx::{Connection as _, PgConnection, postgres::PgConnectOptions};
use tracing::instrument;

use crate::config::{Config, MemoryBudget};

/// Errors that can occur when opening, tuning or closing the session.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Error connecting to the DB.
    #[error("Error connecting to db: {0}")]
    Connect(#[source] sqlx::Error),

    /// Error applying a session setting.
    #[error("Error applying session setting '{setting}'")]
    Tune {
        setting: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Error closing the connection.
    #[error("Error closing db connection: {0}")]
    Close(#[source] sqlx::Error),
}

/// A dedicated connection to the destination database.
///
/// The whole run (DDL, reads, `COPY` in both directions, maintenance) goes through this one
/// session. It is tuned for bulk work right after connecting: `work_mem` and
/// `maintenance_work_mem` are raised and `synchronous_commit` is turned off.
#[derive(Debug)]
pub struct Session(PgConnection);

impl Session {
    /// Opens and tunes the session described by the run configuration.
    pub async fn connect(config: &Config) -> Result<Self, ConnError> {
        Self::connect_with(&config.connect_options(), &config.work_mem).await
    }

    /// Opens and tunes a session. There is no retry: a failed connect fails the run.
    #[instrument(skip_all, err)]
    pub async fn connect_with(
        options: &PgConnectOptions,
        work_mem: &MemoryBudget,
    ) -> Result<Self, ConnError> {
        let conn = PgConnection::connect_with(options)
            .await
            .map_err(ConnError::Connect)?;

        let mut session = Self(conn);
        session.tune(work_mem).await?;

        tracing::info!(%work_mem, "db_session_ready");
        Ok(session)
    }

    async fn tune(&mut self, work_mem: &MemoryBudget) -> Result<(), ConnError> {
        let settings = [
            ("work_mem", format!("SET work_mem = '{work_mem}'")),
            (
                "maintenance_work_mem",
                format!("SET maintenance_work_mem = '{work_mem}'"),
            ),
            (
                "synchronous_commit",
                "SET synchronous_commit = OFF".to_string(),
            ),
        ];

        for (setting, statement) in settings {
            sqlx::raw_sql(&statement)
                .execute(&mut self.0)
                .await
                .map_err(|source| ConnError::Tune { setting, source })?;
        }

        Ok(())
    }

    /// Closes the session, sending a graceful terminate to the server.
    pub async fn close(self) -> Result<(), ConnError> {
        self.0.close().await.map_err(ConnError::Close)
    }
}

impl std::ops::Deref for Session {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
