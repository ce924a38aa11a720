//! SurrealDB schema setup.
//!
//! Safe to call on every connection: every definition is `IF NOT EXISTS`.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::Result;

/// Initialize all UEPS tables.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing UEPS SurrealDB schema");

    init_runs_table(db).await?;
    init_run_events_table(db).await?;
    init_pipeline_snapshots_table(db).await?;
    init_published_versions_table(db).await?;

    info!("UEPS schema initialization complete");
    Ok(())
}

/// `runs`: one row per release pipeline run.
///
/// ```text
/// TABLE runs {
///   run_id:             STRING (unique)
///   definition_digest:  STRING (indexed)
///   revision:           STRING?
///   pipeline_name:      STRING (indexed)
///   tags:               OBJECT
///   status:             STRING (running | completed | failed)
///   total_events:       INT
///   duration_ms:        INT
///   success:            BOOL
///   created_at:         DATETIME
///   completed_at:       DATETIME?
/// }
/// ```
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_definition_digest ON TABLE runs COLUMNS definition_digest;
        DEFINE INDEX IF NOT EXISTS idx_pipeline_name ON TABLE runs COLUMNS pipeline_name;
        DEFINE INDEX IF NOT EXISTS idx_created_at ON TABLE runs COLUMNS created_at;
        DEFINE INDEX IF NOT EXISTS idx_status ON TABLE runs COLUMNS status;
    "#;

    db.query(sql).await?;
    Ok(())
}

/// `run_events`: append-only events, `(run_id, seq)` unique.
async fn init_run_events_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing run_events table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS run_events AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_id_seq ON TABLE run_events COLUMNS run_id, seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE run_events COLUMNS run_id;
    "#;

    db.query(sql).await?;
    Ok(())
}

/// `pipeline_snapshots`: one row per image pipeline, replaced on every
/// successful build.
async fn init_pipeline_snapshots_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing pipeline_snapshots table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS pipeline_snapshots AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete FULL;

        DEFINE INDEX IF NOT EXISTS idx_pipeline ON TABLE pipeline_snapshots COLUMNS pipeline UNIQUE;
    "#;

    db.query(sql).await?;
    Ok(())
}

/// `published_versions`: append-only component and recipe identities,
/// `(kind, name, version)` unique.
async fn init_published_versions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing published_versions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS published_versions AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_published_identity ON TABLE published_versions COLUMNS kind, name, version UNIQUE;
    "#;

    db.query(sql).await?;
    Ok(())
}
