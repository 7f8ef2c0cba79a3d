use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

/// Scripts compiled into the binary, applied in order on startup.
const SCRIPTS: &[(ScriptStage, &str, &str)] = &[
    (
        ScriptStage::Schema,
        "001_schema.sql",
        include_str!("sql/001_schema.sql"),
    ),
    (
        ScriptStage::Indexes,
        "002_indexes.sql",
        include_str!("sql/002_indexes.sql"),
    ),
    (
        ScriptStage::Directory,
        "003_directory.sql",
        include_str!("sql/003_directory.sql"),
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptStage {
    Schema,
    Indexes,
    Directory,
}

impl ScriptStage {
    const fn label(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Indexes => "indexes",
            Self::Directory => "directory",
        }
    }
}

impl std::fmt::Display for ScriptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database error executing {script} ({stage}): {source}")]
    Sql {
        stage: &'static str,
        script: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Apply every bootstrap script. Scripts are idempotent.
pub async fn run(pool: &PgPool) -> Result<(), BootstrapError> {
    info!(count = SCRIPTS.len(), "running database bootstrap");

    for (stage, script, sql) in SCRIPTS {
        apply_script(pool, *stage, script, sql).await?;
    }

    Ok(())
}

/// Simple liveness check used during startup.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Readiness probe: the message table must exist and answer a query.
pub async fn ensure_readiness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1 FROM shoutbox_messages LIMIT 1")
        .execute(pool)
        .await
        .map(|_| ())
}

async fn apply_script(
    pool: &PgPool,
    stage: ScriptStage,
    script: &'static str,
    sql: &str,
) -> Result<(), BootstrapError> {
    let to_error = |source| BootstrapError::Sql {
        stage: stage.label(),
        script,
        source,
    };

    let trimmed = sql.trim();
    if trimmed.is_empty() {
        warn!(script, "skipping empty bootstrap script");
        return Ok(());
    }

    let mut transaction = pool.begin().await.map_err(to_error)?;
    info!(stage = %stage, script, "executing bootstrap script");
    sqlx::raw_sql(trimmed)
        .execute(&mut *transaction)
        .await
        .map_err(to_error)?;
    transaction.commit().await.map_err(to_error)
}
