//! PostgreSQL storage implementation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{HealthStatus, PoolStats, StorageError, StorageResult};
use crate::traits::{
    validate_group, validate_group_id, validate_node, AuditAction, AuditEntry, PermissionStore,
    StoredGroup, StoredMembership, StoredProfile,
};

/// Default health check timeout in seconds.
/// Uses a shorter timeout than regular queries since health checks should be fast.
const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Default query timeout in seconds.
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 10;

/// PostgreSQL configuration options.
#[derive(Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    pub min_connections: u32,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Default query timeout in seconds.
    ///
    /// A query exceeding it fails with `StorageError::QueryTimeout`.
    pub query_timeout_secs: u64,
    /// Timeout for read operations in seconds.
    ///
    /// Applies to: `load_all_groups`, `load_profile`, `read_audit_log`.
    /// Falls back to `query_timeout_secs` if not set.
    pub read_timeout_secs: Option<u64>,
    /// Timeout for write transactions in seconds.
    ///
    /// Falls back to `query_timeout_secs` if not set.
    pub write_timeout_secs: Option<u64>,
    /// Timeout for health checks in seconds.
    pub health_check_timeout_secs: u64,
}

// Custom Debug implementation to hide credentials in database_url
impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("write_timeout_secs", &self.write_timeout_secs)
            .field("health_check_timeout_secs", &self.health_check_timeout_secs)
            .finish()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/rankguard".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            read_timeout_secs: None,
            write_timeout_secs: None,
            health_check_timeout_secs: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
        }
    }
}

/// Maps a sqlx error onto the storage taxonomy.
///
/// Connection loss and serialization failures are transient; constraint
/// violations are not.
fn map_sqlx_error(context: &str, e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::ConnectionError {
                message: format!("{context}: {e}"),
            }
        }
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // foreign_key_violation, unique_violation, check_violation
            Some("23503") | Some("23505") | Some("23514") => StorageError::ConstraintViolation {
                message: format!("{context}: {}", db_err.message()),
            },
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => StorageError::TransactionError {
                message: format!("{context}: {e}"),
            },
            _ => StorageError::QueryError {
                message: format!("{context}: {e}"),
            },
        },
        _ => StorageError::QueryError {
            message: format!("{context}: {e}"),
        },
    }
}

/// Reads a column, turning a type mismatch into an error instead of a panic.
fn column<'r, T>(row: &'r PgRow, name: &str) -> StorageResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StorageError::SerializationError {
            message: format!("Failed to decode column '{name}': {e}"),
        })
}

/// Appends an audit row inside the caller's transaction.
async fn insert_audit(
    tx: &mut Transaction<'_, Postgres>,
    action: AuditAction,
    player: Option<Uuid>,
    group_id: Option<&str>,
    detail: serde_json::Value,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO permission_audit_log (action, player_id, group_id, detail, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        "#,
    )
    .bind(action.as_str())
    .bind(player)
    .bind(group_id)
    .bind(detail)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("Failed to write audit row", e))?;
    Ok(())
}

async fn begin(pool: &PgPool) -> StorageResult<Transaction<'static, Postgres>> {
    pool.begin()
        .await
        .map_err(|e| StorageError::TransactionError {
            message: format!("Failed to begin transaction: {e}"),
        })
}

async fn commit(tx: Transaction<'_, Postgres>) -> StorageResult<()> {
    tx.commit()
        .await
        .map_err(|e| StorageError::TransactionError {
            message: format!("Failed to commit transaction: {e}"),
        })
}

async fn ensure_player(tx: &mut Transaction<'_, Postgres>, player: Uuid) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO permission_players (player_id, created_at)
        VALUES ($1, NOW())
        ON CONFLICT (player_id) DO NOTHING
        "#,
    )
    .bind(player)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("Failed to create player", e))?;
    Ok(())
}

/// PostgreSQL implementation of PermissionStore.
pub struct PostgresPermissionStore {
    pool: PgPool,
    /// Read operation timeout duration.
    read_timeout: Duration,
    /// Write transaction timeout duration.
    write_timeout: Duration,
    /// Health check timeout duration.
    health_check_timeout: Duration,
}

impl PostgresPermissionStore {
    /// Creates a new store from a connection pool with default timeouts.
    pub fn new(pool: PgPool) -> Self {
        let default_timeout = Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS);
        Self {
            pool,
            read_timeout: default_timeout,
            write_timeout: default_timeout,
            health_check_timeout: Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
        }
    }

    /// Creates a new store with the given configuration.
    #[instrument(skip(config))]
    pub async fn from_config(config: &PostgresConfig) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| StorageError::ConnectionError {
                message: e.to_string(),
            })?;

        let default_timeout = Duration::from_secs(config.query_timeout_secs);

        Ok(Self {
            pool,
            read_timeout: config
                .read_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            write_timeout: config
                .write_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            health_check_timeout: Duration::from_secs(config.health_check_timeout_secs),
        })
    }

    /// Creates a new store from a database URL.
    pub async fn from_url(database_url: &str) -> StorageResult<Self> {
        let config = PostgresConfig {
            database_url: database_url.to_string(),
            ..Default::default()
        };
        Self::from_config(&config).await
    }

    /// Wraps an async operation with a timeout and records metrics.
    ///
    /// # Metrics
    /// - `rankguard_storage_query_duration_seconds` - Histogram of query durations
    /// - `rankguard_storage_query_timeout_total` - Counter of timeout events
    async fn execute_with_timeout_and_metrics<T, F>(
        &self,
        operation: &str,
        timeout: Duration,
        future: F,
    ) -> StorageResult<T>
    where
        F: std::future::Future<Output = StorageResult<T>>,
    {
        let start = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, future).await;
        let duration = start.elapsed().as_secs_f64();

        let (status, final_result) = match result {
            Ok(Ok(value)) => ("success", Ok(value)),
            Ok(Err(e)) => ("error", Err(e)),
            Err(_elapsed) => (
                "timeout",
                Err(StorageError::QueryTimeout {
                    operation: operation.to_string(),
                    timeout,
                }),
            ),
        };

        metrics::histogram!(
            "rankguard_storage_query_duration_seconds",
            "operation" => operation.to_string(),
            "backend" => "postgres",
            "status" => status.to_string()
        )
        .record(duration);

        if status == "timeout" {
            metrics::counter!(
                "rankguard_storage_query_timeout_total",
                "operation" => operation.to_string(),
                "backend" => "postgres"
            )
            .increment(1);
        }

        final_result
    }

    /// Executes a read operation with the configured read timeout.
    async fn execute_read<T, F>(&self, operation: &str, future: F) -> StorageResult<T>
    where
        F: std::future::Future<Output = StorageResult<T>>,
    {
        self.execute_with_timeout_and_metrics(operation, self.read_timeout, future)
            .await
    }

    /// Executes a write transaction with the configured write timeout.
    ///
    /// On timeout the transaction is rolled back when it is dropped.
    async fn execute_write<T, F>(&self, operation: &str, future: F) -> StorageResult<T>
    where
        F: std::future::Future<Output = StorageResult<T>>,
    {
        self.execute_with_timeout_and_metrics(operation, self.write_timeout, future)
            .await
    }

    /// Runs database migrations to create required tables.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> StorageResult<()> {
        debug!("Running database migrations");

        let statements: [(&str, &str); 10] = [
            (
                "permission_groups table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_groups (
                    id VARCHAR(64) PRIMARY KEY,
                    name VARCHAR(255) NOT NULL,
                    prefix VARCHAR(255),
                    is_default BOOLEAN NOT NULL DEFAULT FALSE,
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "single default index",
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS idx_permission_groups_single_default
                ON permission_groups (is_default) WHERE is_default
                "#,
            ),
            (
                "permission_group_parents table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_group_parents (
                    group_id VARCHAR(64) NOT NULL REFERENCES permission_groups(id) ON DELETE CASCADE,
                    parent_id VARCHAR(64) NOT NULL REFERENCES permission_groups(id) ON DELETE RESTRICT,
                    PRIMARY KEY (group_id, parent_id),
                    CHECK (group_id <> parent_id)
                )
                "#,
            ),
            (
                "permission_group_entries table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_group_entries (
                    group_id VARCHAR(64) NOT NULL REFERENCES permission_groups(id) ON DELETE CASCADE,
                    node VARCHAR(256) NOT NULL,
                    value BOOLEAN NOT NULL,
                    PRIMARY KEY (group_id, node)
                )
                "#,
            ),
            (
                "permission_players table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_players (
                    player_id UUID PRIMARY KEY,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "permission_memberships table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_memberships (
                    player_id UUID NOT NULL REFERENCES permission_players(player_id) ON DELETE CASCADE,
                    group_id VARCHAR(64) NOT NULL REFERENCES permission_groups(id) ON DELETE CASCADE,
                    expires_at TIMESTAMP WITH TIME ZONE,
                    granted_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (player_id, group_id)
                )
                "#,
            ),
            (
                "membership expiry index",
                r#"
                CREATE INDEX IF NOT EXISTS idx_permission_memberships_expires_at
                ON permission_memberships (expires_at) WHERE expires_at IS NOT NULL
                "#,
            ),
            (
                "permission_overrides table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_overrides (
                    player_id UUID NOT NULL REFERENCES permission_players(player_id) ON DELETE CASCADE,
                    node VARCHAR(256) NOT NULL,
                    value BOOLEAN NOT NULL,
                    PRIMARY KEY (player_id, node)
                )
                "#,
            ),
            (
                "permission_audit_log table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_audit_log (
                    id BIGSERIAL PRIMARY KEY,
                    action VARCHAR(32) NOT NULL,
                    player_id UUID,
                    group_id VARCHAR(64),
                    detail JSONB NOT NULL DEFAULT '{}'::jsonb,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "audit player index",
                r#"
                CREATE INDEX IF NOT EXISTS idx_permission_audit_log_player
                ON permission_audit_log (player_id, id DESC)
                "#,
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::QueryError {
                    message: format!("Failed to create {what}: {e}"),
                })?;
        }

        debug!("Database migrations completed successfully");
        Ok(())
    }

    /// Returns the connection pool for testing or advanced usage.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PermissionStore for PostgresPermissionStore {
    #[instrument(skip(self))]
    async fn load_all_groups(&self) -> StorageResult<Vec<StoredGroup>> {
        let (group_rows, parent_rows, entry_rows) = self
            .execute_read("load_all_groups", async {
                let groups = sqlx::query(
                    "SELECT id, name, prefix, is_default FROM permission_groups ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("Failed to load groups", e))?;
                let parents = sqlx::query(
                    "SELECT group_id, parent_id FROM permission_group_parents ORDER BY group_id, parent_id",
                )
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("Failed to load group parents", e))?;
                let entries = sqlx::query(
                    "SELECT group_id, node, value FROM permission_group_entries ORDER BY group_id, node",
                )
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("Failed to load group entries", e))?;
                Ok((groups, parents, entries))
            })
            .await?;

        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        for row in &parent_rows {
            parents
                .entry(column(row, "group_id")?)
                .or_default()
                .push(column(row, "parent_id")?);
        }
        let mut entries: HashMap<String, BTreeMap<String, bool>> = HashMap::new();
        for row in &entry_rows {
            entries
                .entry(column(row, "group_id")?)
                .or_default()
                .insert(column(row, "node")?, column(row, "value")?);
        }

        group_rows
            .iter()
            .map(|row| {
                let id: String = column(row, "id")?;
                Ok(StoredGroup {
                    name: column(row, "name")?,
                    prefix: column(row, "prefix")?,
                    is_default: column(row, "is_default")?,
                    parents: parents.remove(&id).unwrap_or_default(),
                    permissions: entries.remove(&id).unwrap_or_default(),
                    id,
                })
            })
            .collect()
    }

    #[instrument(skip(self, group), fields(group_id = %group.id))]
    async fn save_group(&self, group: &StoredGroup) -> StorageResult<()> {
        validate_group(group)?;

        self.execute_write("save_group", async {
            let mut tx = begin(&self.pool).await?;

            if !group.parents.is_empty() {
                let known: Vec<String> = sqlx::query_scalar(
                    "SELECT id FROM permission_groups WHERE id = ANY($1)",
                )
                .bind(&group.parents)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to check parent groups", e))?;
                if let Some(missing) = group.parents.iter().find(|p| !known.contains(p)) {
                    return Err(StorageError::GroupNotFound {
                        group_id: missing.clone(),
                    });
                }
            }

            if group.is_default {
                sqlx::query(
                    "UPDATE permission_groups SET is_default = FALSE WHERE is_default AND id <> $1",
                )
                .bind(&group.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to clear previous default group", e))?;
            }

            sqlx::query(
                r#"
                INSERT INTO permission_groups (id, name, prefix, is_default, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name,
                    prefix = EXCLUDED.prefix,
                    is_default = EXCLUDED.is_default,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&group.id)
            .bind(&group.name)
            .bind(&group.prefix)
            .bind(group.is_default)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("Failed to save group", e))?;

            sqlx::query("DELETE FROM permission_group_parents WHERE group_id = $1")
                .bind(&group.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to replace group parents", e))?;
            if !group.parents.is_empty() {
                sqlx::query(
                    r#"
                    INSERT INTO permission_group_parents (group_id, parent_id)
                    SELECT $1, parent_id FROM UNNEST($2::text[]) AS p(parent_id)
                    "#,
                )
                .bind(&group.id)
                .bind(&group.parents)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to insert group parents", e))?;
            }

            sqlx::query("DELETE FROM permission_group_entries WHERE group_id = $1")
                .bind(&group.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to replace group entries", e))?;
            if !group.permissions.is_empty() {
                let nodes: Vec<String> = group.permissions.keys().cloned().collect();
                let values: Vec<bool> = group.permissions.values().copied().collect();
                sqlx::query(
                    r#"
                    INSERT INTO permission_group_entries (group_id, node, value)
                    SELECT $1, e.node, e.value FROM UNNEST($2::text[], $3::bool[]) AS e(node, value)
                    "#,
                )
                .bind(&group.id)
                .bind(&nodes)
                .bind(&values)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to insert group entries", e))?;
            }

            insert_audit(
                &mut tx,
                AuditAction::SaveGroup,
                None,
                Some(&group.id),
                json!({
                    "name": group.name,
                    "parents": group.parents,
                    "permissions": group.permissions.len(),
                    "is_default": group.is_default,
                }),
            )
            .await?;

            commit(tx).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_group(&self, id: &str) -> StorageResult<()> {
        validate_group_id(id)?;

        self.execute_write("delete_group", async {
            let mut tx = begin(&self.pool).await?;

            let children: Vec<String> = sqlx::query_scalar(
                "SELECT group_id FROM permission_group_parents WHERE parent_id = $1 ORDER BY group_id",
            )
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("Failed to check child groups", e))?;
            if !children.is_empty() {
                return Err(StorageError::ConstraintViolation {
                    message: format!("group '{id}' is still a parent of: {}", children.join(", ")),
                });
            }

            let memberships = sqlx::query("DELETE FROM permission_memberships WHERE group_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to delete memberships", e))?
                .rows_affected();

            let deleted = sqlx::query("DELETE FROM permission_groups WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to delete group", e))?
                .rows_affected();
            if deleted == 0 {
                return Err(StorageError::GroupNotFound {
                    group_id: id.to_string(),
                });
            }

            insert_audit(
                &mut tx,
                AuditAction::DeleteGroup,
                None,
                Some(id),
                json!({ "memberships_removed": memberships }),
            )
            .await?;

            commit(tx).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn load_profile(&self, player: Uuid) -> StorageResult<Option<StoredProfile>> {
        let rows = self
            .execute_read("load_profile", async {
                let player_row = sqlx::query(
                    "SELECT created_at FROM permission_players WHERE player_id = $1",
                )
                .bind(player)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("Failed to load player", e))?;
                let Some(player_row) = player_row else {
                    return Ok(None);
                };

                let memberships = sqlx::query(
                    r#"
                    SELECT group_id, expires_at, granted_at
                    FROM permission_memberships
                    WHERE player_id = $1
                    ORDER BY granted_at, group_id
                    "#,
                )
                .bind(player)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("Failed to load memberships", e))?;

                let overrides = sqlx::query(
                    "SELECT node, value FROM permission_overrides WHERE player_id = $1",
                )
                .bind(player)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("Failed to load overrides", e))?;

                Ok(Some((player_row, memberships, overrides)))
            })
            .await?;

        let Some((player_row, membership_rows, override_rows)) = rows else {
            return Ok(None);
        };

        let mut profile = StoredProfile::new(player, column(&player_row, "created_at")?);
        for row in &membership_rows {
            profile.memberships.push(StoredMembership {
                group_id: column(row, "group_id")?,
                expires_at: column(row, "expires_at")?,
                granted_at: column(row, "granted_at")?,
            });
        }
        for row in &override_rows {
            profile
                .overrides
                .insert(column(row, "node")?, column(row, "value")?);
        }
        Ok(Some(profile))
    }

    #[instrument(skip(self))]
    async fn ensure_profile(&self, player: Uuid) -> StorageResult<()> {
        self.execute_write("ensure_profile", async {
            sqlx::query(
                r#"
                INSERT INTO permission_players (player_id, created_at)
                VALUES ($1, NOW())
                ON CONFLICT (player_id) DO NOTHING
                "#,
            )
            .bind(player)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("Failed to create player", e))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn grant_group(
        &self,
        player: Uuid,
        group_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        validate_group_id(group_id)?;

        self.execute_write("grant_group", async {
            let mut tx = begin(&self.pool).await?;

            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM permission_groups WHERE id = $1)")
                    .bind(group_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("Failed to check group existence", e))?;
            if !exists {
                return Err(StorageError::GroupNotFound {
                    group_id: group_id.to_string(),
                });
            }

            ensure_player(&mut tx, player).await?;

            sqlx::query(
                r#"
                INSERT INTO permission_memberships (player_id, group_id, expires_at, granted_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (player_id, group_id) DO UPDATE
                SET expires_at = EXCLUDED.expires_at
                "#,
            )
            .bind(player)
            .bind(group_id)
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("Failed to grant group", e))?;

            insert_audit(
                &mut tx,
                AuditAction::GrantGroup,
                Some(player),
                Some(group_id),
                json!({ "expires_at": expires_at }),
            )
            .await?;

            commit(tx).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn revoke_group(&self, player: Uuid, group_id: &str) -> StorageResult<()> {
        validate_group_id(group_id)?;

        self.execute_write("revoke_group", async {
            let mut tx = begin(&self.pool).await?;

            let removed = sqlx::query(
                "DELETE FROM permission_memberships WHERE player_id = $1 AND group_id = $2",
            )
            .bind(player)
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("Failed to revoke group", e))?
            .rows_affected();
            if removed == 0 {
                return Err(StorageError::MembershipNotFound {
                    player_id: player,
                    group_id: group_id.to_string(),
                });
            }

            insert_audit(&mut tx, AuditAction::RevokeGroup, Some(player), Some(group_id), json!({}))
                .await?;

            commit(tx).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn set_override(&self, player: Uuid, node: &str, value: bool) -> StorageResult<()> {
        validate_node(node)?;

        self.execute_write("set_override", async {
            let mut tx = begin(&self.pool).await?;
            ensure_player(&mut tx, player).await?;

            sqlx::query(
                r#"
                INSERT INTO permission_overrides (player_id, node, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (player_id, node) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(player)
            .bind(node)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("Failed to set override", e))?;

            insert_audit(
                &mut tx,
                AuditAction::SetOverride,
                Some(player),
                None,
                json!({ "node": node, "value": value }),
            )
            .await?;

            commit(tx).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn clear_override(&self, player: Uuid, node: &str) -> StorageResult<()> {
        validate_node(node)?;

        self.execute_write("clear_override", async {
            let mut tx = begin(&self.pool).await?;

            let removed =
                sqlx::query("DELETE FROM permission_overrides WHERE player_id = $1 AND node = $2")
                    .bind(player)
                    .bind(node)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("Failed to clear override", e))?
                    .rows_affected();
            if removed == 0 {
                return Err(StorageError::OverrideNotFound {
                    player_id: player,
                    node: node.to_string(),
                });
            }

            insert_audit(
                &mut tx,
                AuditAction::ClearOverride,
                Some(player),
                None,
                json!({ "node": node }),
            )
            .await?;

            commit(tx).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn purge_expired_memberships(
        &self,
        player: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<String>> {
        self.execute_write("purge_expired_memberships", async {
            let mut tx = begin(&self.pool).await?;

            let purged: Vec<String> = sqlx::query_scalar(
                r#"
                DELETE FROM permission_memberships
                WHERE player_id = $1 AND expires_at IS NOT NULL AND expires_at <= $2
                RETURNING group_id
                "#,
            )
            .bind(player)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("Failed to purge expired memberships", e))?;

            if !purged.is_empty() {
                insert_audit(
                    &mut tx,
                    AuditAction::PurgeExpired,
                    Some(player),
                    None,
                    json!({ "groups": purged }),
                )
                .await?;
            }

            commit(tx).await?;
            Ok(purged)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn read_audit_log(&self, limit: usize) -> StorageResult<Vec<AuditEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .execute_read("read_audit_log", async {
                sqlx::query(
                    r#"
                    SELECT id, action, player_id, group_id, detail, created_at
                    FROM permission_audit_log
                    ORDER BY id DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("Failed to read audit log", e))
            })
            .await?;

        rows.iter()
            .map(|row| {
                let action: String = column(row, "action")?;
                Ok(AuditEntry {
                    id: column(row, "id")?,
                    action: action.parse()?,
                    player_id: column(row, "player_id")?,
                    group_id: column(row, "group_id")?,
                    detail: column(row, "detail")?,
                    created_at: column(row, "created_at")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let start = std::time::Instant::now();

        // Uses a shorter dedicated timeout since health checks should be fast
        let check_result = tokio::time::timeout(self.health_check_timeout, async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::HealthCheckFailed {
                    message: format!("database ping failed: {e}"),
                })
        })
        .await;

        let latency = start.elapsed();

        match check_result {
            Ok(result) => {
                result?;
            }
            Err(_elapsed) => {
                return Err(StorageError::QueryTimeout {
                    operation: "health_check".to_string(),
                    timeout: self.health_check_timeout,
                });
            }
        }

        // Note: pool.size() returns total connections, so active = size - idle
        let total_connections = self.pool.size();
        let idle_connections = self.pool.num_idle() as u32;
        let active_connections = total_connections.saturating_sub(idle_connections);
        let max_connections = self.pool.options().get_max_connections();

        Ok(HealthStatus {
            healthy: true,
            latency,
            pool_stats: Some(PoolStats {
                active_connections,
                idle_connections,
                max_connections,
            }),
            message: Some("postgresql".to_string()),
        })
    }
}

impl std::fmt::Debug for PostgresPermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPermissionStore")
            .field("pool", &"PgPool")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_debug_redacts_url() {
        let config = PostgresConfig {
            database_url: "postgres://admin:hunter2@db/rankguard".to_string(),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(map_sqlx_error("load", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("load", sqlx::Error::PoolClosed).is_transient());
        assert!(!map_sqlx_error("load", sqlx::Error::RowNotFound).is_transient());
    }
}
