use std::{sync::Mutex, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::audit::{AuditLog, CreateAuditLog};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS audit_logs (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        application TEXT NOT NULL,
        message TEXT NOT NULL,
        logged_at TIMESTAMPTZ NOT NULL,
        ip TEXT NOT NULL,
        user_agent TEXT NOT NULL,
        success BOOLEAN NOT NULL,
        error_message TEXT
    )
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS audit_logs_logged_at_idx ON audit_logs (logged_at DESC)";

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, log: CreateAuditLog) -> Result<AuditLog, Error>;

    /// Newest first.
    async fn list(&self, limit: i64) -> Result<Vec<AuditLog>, Error>;

    async fn health_check(&self) -> Result<(), Error>;
}

/// PostgreSQL audit store. Connections come from a pool, so a dropped
/// connection (database restart, network loss) is replaced on next use.
pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    /// Connects, verifies the connection with a round trip and creates the
    /// audit table if missing. Any of those failing fails the connect.
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        let database = Self { pool };

        database.health_check().await?;

        for statement in [CREATE_TABLE, CREATE_INDEX] {
            sqlx::query(statement)
                .execute(&database.pool)
                .await
                .map_err(|e| anyhow!("Failed to create audit_logs table: {}", e))?;
        }

        info!("PostgreSQL connection established");

        Ok(database)
    }
}

fn audit_log_from_row(row: &PgRow) -> Result<AuditLog, sqlx::Error> {
    Ok(AuditLog {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        application: row.try_get("application")?,
        message: row.try_get("message")?,
        timestamp: row.try_get("logged_at")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        success: row.try_get("success")?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl AuditStore for DatabaseClient {
    async fn insert(&self, log: CreateAuditLog) -> Result<AuditLog, Error> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id,
                user_id,
                application,
                message,
                logged_at,
                ip,
                user_agent,
                success,
                error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&log.user_id)
        .bind(&log.application)
        .bind(&log.message)
        .bind(log.timestamp)
        .bind(&log.ip)
        .bind(&log.user_agent)
        .bind(log.success)
        .bind(&log.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(
                error = %e,
                user_id = %log.user_id,
                application = %log.application,
                "Failed to write audit log to database"
            );
            anyhow!("Database write failed: {}", e)
        })?;

        debug!(%id, success = log.success, "Audit log written to database");

        Ok(log.into_audit_log(id))
    }

    async fn list(&self, limit: i64) -> Result<Vec<AuditLog>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, application, message, logged_at, ip, user_agent,
                   success, error_message
            FROM audit_logs
            ORDER BY logged_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to read audit logs: {}", e))?;

        rows.iter()
            .map(audit_log_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Malformed audit log row: {}", e))
    }

    async fn health_check(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}

/// Audit store kept in process memory.
#[derive(Default)]
pub struct MemoryAuditStore {
    logs: Mutex<Vec<AuditLog>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logs.lock().map(|logs| logs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, log: CreateAuditLog) -> Result<AuditLog, Error> {
        let log = log.into_audit_log(Uuid::new_v4());
        self.logs
            .lock()
            .map_err(|_| anyhow!("Audit store lock poisoned"))?
            .push(log.clone());
        Ok(log)
    }

    async fn list(&self, limit: i64) -> Result<Vec<AuditLog>, Error> {
        let logs = self
            .logs
            .lock()
            .map_err(|_| anyhow!("Audit store lock poisoned"))?;

        let mut newest_first: Vec<AuditLog> = logs.iter().rev().cloned().collect();
        newest_first.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        newest_first.truncate(limit.max(0) as usize);
        Ok(newest_first)
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}
