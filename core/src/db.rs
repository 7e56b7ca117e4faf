use std::path::Path;

use surrealdb::engine::local::Db;
use surrealdb::Surreal;

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
    pub db: Surreal<Db>,
}

/// Initialize the embedded database: connect, select ns/db, run migrations.
pub async fn init(path: &Path) -> Result<DbHandle, surrealdb::Error> {
    let db = Surreal::new::<surrealdb::engine::local::SurrealKv>(path.to_path_buf()).await?;
    db.use_ns("atelier").use_db("atelier").await?;
    run_migrations(&db).await?;
    Ok(DbHandle { db })
}

/// In-memory database for tests.
#[cfg(test)]
pub async fn init_mem() -> DbHandle {
    let db = Surreal::new::<surrealdb::engine::local::Mem>(())
        .await
        .expect("mem db");
    db.use_ns("atelier").use_db("atelier").await.expect("ns/db");
    run_migrations(&db).await.expect("migrations");
    DbHandle { db }
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), surrealdb::Error> {
    db.query(SCHEMA_V1).await?.check()?;
    Ok(())
}

// Canonical-key indexes are deliberately non-unique: racing sync passes
// can insert duplicates, and the reconciliation passes remove them.
const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE user SCHEMAFULL;
    DEFINE FIELD OVERWRITE name ON user TYPE string;
    DEFINE FIELD OVERWRITE email ON user TYPE option<string>;
    DEFINE FIELD OVERWRITE created_at ON user TYPE datetime;

    DEFINE TABLE OVERWRITE project SCHEMAFULL;
    DEFINE FIELD OVERWRITE name ON project TYPE string;
    DEFINE FIELD OVERWRITE owner ON project TYPE record<user>;
    DEFINE FIELD OVERWRITE status ON project TYPE string;
    DEFINE FIELD OVERWRITE created_at ON project TYPE datetime;
    DEFINE FIELD OVERWRITE updated_at ON project TYPE datetime;

    DEFINE TABLE OVERWRITE folder SCHEMAFULL;
    DEFINE FIELD OVERWRITE project ON folder TYPE record<project>;
    DEFINE FIELD OVERWRITE name ON folder TYPE string;
    DEFINE FIELD OVERWRITE path ON folder TYPE string;
    DEFINE FIELD OVERWRITE parent ON folder TYPE option<record<folder>>;
    DEFINE FIELD OVERWRITE files ON folder TYPE array<record<file>>;
    DEFINE FIELD OVERWRITE subfolders ON folder TYPE array<record<folder>>;
    DEFINE FIELD OVERWRITE level ON folder TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE archived ON folder TYPE bool DEFAULT false;
    DEFINE FIELD OVERWRITE created_by ON folder TYPE option<record<user>>;
    DEFINE FIELD OVERWRITE created_at ON folder TYPE datetime;
    DEFINE FIELD OVERWRITE updated_at ON folder TYPE datetime;
    DEFINE INDEX OVERWRITE idx_folder_key ON folder FIELDS project, path, name;
    DEFINE INDEX OVERWRITE idx_folder_parent ON folder FIELDS parent;

    DEFINE TABLE OVERWRITE file SCHEMAFULL;
    DEFINE FIELD OVERWRITE project ON file TYPE record<project>;
    DEFINE FIELD OVERWRITE name ON file TYPE string;
    DEFINE FIELD OVERWRITE path ON file TYPE string;
    DEFINE FIELD OVERWRITE folder ON file TYPE record<folder>;
    DEFINE FIELD OVERWRITE content ON file TYPE string;
    DEFINE FIELD OVERWRITE size ON file TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE is_locked ON file TYPE bool DEFAULT false;
    DEFINE FIELD OVERWRITE locked_by ON file TYPE option<record<user>>;
    DEFINE FIELD OVERWRITE version ON file TYPE int DEFAULT 1;
    DEFINE FIELD OVERWRITE versions ON file TYPE array<object>;
    DEFINE FIELD OVERWRITE versions.*.version ON file TYPE int;
    DEFINE FIELD OVERWRITE versions.*.content ON file TYPE string;
    DEFINE FIELD OVERWRITE versions.*.size ON file TYPE int;
    DEFINE FIELD OVERWRITE versions.*.saved_by ON file TYPE option<record<user>>;
    DEFINE FIELD OVERWRITE versions.*.saved_at ON file TYPE datetime;
    DEFINE FIELD OVERWRITE created_by ON file TYPE option<record<user>>;
    DEFINE FIELD OVERWRITE created_at ON file TYPE datetime;
    DEFINE FIELD OVERWRITE updated_at ON file TYPE datetime;
    DEFINE INDEX OVERWRITE idx_file_key ON file FIELDS project, path;
    DEFINE INDEX OVERWRITE idx_file_folder ON file FIELDS folder;
";
