//! SQLite adapter for `Warehouse` and `RunLedger`
//!
//! The main database file holds the run ledger. The cleaned and model stores
//! live in two attached databases so that tables are schema-qualified as
//! `silver.*` and `gold.*`. For a main file `warehouse.db` the attached files
//! are `warehouse.silver.db` and `warehouse.gold.db`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    CustomerSegment, LockAttempt, MeasureColumn, MeasureKind, ModelTable, RunLedger, RunLock,
    RunRecord, RunStatus, StageEntry, StageStatus, StagedRecord, Warehouse,
};
use crate::{Result, StorageError};

const STAGED_COLUMNS: &str = "customer_id, gender, senior_citizen, partner, dependents, tenure,
    phone_service, multiple_lines, internet_service, online_security, online_backup,
    device_protection, tech_support, streaming_tv, streaming_movies, contract_type,
    paperless_billing, payment_method, monthly_charges, total_charges, avg_monthly_revenue,
    customer_segment, churned, ingestion_timestamp";

const RUN_COLUMNS: &str = "run_id, dataset_id, status, started_at, finished_at, raw_checksum,
    raw_artifact, failed_stage, error";

/// SQLite-backed warehouse and run ledger
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store rooted at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)?;

        let silver = sibling_path(db_path, "silver");
        let gold = sibling_path(db_path, "gold");
        conn.execute("ATTACH DATABASE ?1 AS silver", params![silver])?;
        conn.execute("ATTACH DATABASE ?1 AS gold", params![gold])?;

        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("ATTACH DATABASE ':memory:' AS silver", [])?;
        conn.execute("ATTACH DATABASE ':memory:' AS gold", [])?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Two invocations may contend on the lock row
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pipeline_runs (
                run_id TEXT PRIMARY KEY,
                dataset_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                raw_checksum TEXT,
                raw_artifact TEXT,
                failed_stage TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_dataset_status
             ON pipeline_runs(dataset_id, status, finished_at);

            CREATE TABLE IF NOT EXISTS pipeline_stage_runs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                rows_in INTEGER NOT NULL,
                rows_out INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                detail TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_stage_runs_run
             ON pipeline_stage_runs(run_id);

            CREATE TRIGGER IF NOT EXISTS pipeline_runs_no_update
             BEFORE UPDATE ON pipeline_runs
             BEGIN SELECT RAISE(ABORT, 'pipeline_runs is append-only'); END;

            CREATE TRIGGER IF NOT EXISTS pipeline_runs_no_delete
             BEFORE DELETE ON pipeline_runs
             BEGIN SELECT RAISE(ABORT, 'pipeline_runs is append-only'); END;

            CREATE TRIGGER IF NOT EXISTS pipeline_stage_runs_no_update
             BEFORE UPDATE ON pipeline_stage_runs
             BEGIN SELECT RAISE(ABORT, 'pipeline_stage_runs is append-only'); END;

            CREATE TABLE IF NOT EXISTS pipeline_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                run_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            );",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS silver.customers_staging (
                customer_id TEXT PRIMARY KEY,
                gender TEXT NOT NULL,
                senior_citizen BOOLEAN NOT NULL,
                partner BOOLEAN NOT NULL,
                dependents BOOLEAN NOT NULL,
                tenure INTEGER NOT NULL CHECK (tenure >= 0),
                phone_service BOOLEAN NOT NULL,
                multiple_lines TEXT NOT NULL,
                internet_service TEXT NOT NULL,
                online_security TEXT NOT NULL,
                online_backup TEXT NOT NULL,
                device_protection TEXT NOT NULL,
                tech_support TEXT NOT NULL,
                streaming_tv TEXT NOT NULL,
                streaming_movies TEXT NOT NULL,
                contract_type TEXT NOT NULL,
                paperless_billing BOOLEAN NOT NULL,
                payment_method TEXT NOT NULL,
                monthly_charges REAL NOT NULL CHECK (monthly_charges >= 0),
                total_charges REAL NOT NULL CHECK (total_charges >= 0),
                avg_monthly_revenue REAL NOT NULL,
                customer_segment TEXT NOT NULL,
                churned BOOLEAN NOT NULL,
                ingestion_timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS silver.idx_staging_segment
             ON customers_staging(customer_segment);

            CREATE TABLE IF NOT EXISTS gold.model_catalog (
                table_name TEXT NOT NULL,
                position INTEGER NOT NULL,
                column_name TEXT NOT NULL,
                role TEXT NOT NULL,
                kind TEXT,
                calculated_at TEXT NOT NULL,
                PRIMARY KEY (table_name, position)
            );",
        )?;

        Ok(())
    }
}

/// `warehouse.db` -> `warehouse.<schema>.db`
fn sibling_path(db_path: &Path, schema: &str) -> String {
    let stem = db_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "warehouse".to_string());
    db_path
        .with_file_name(format!("{}.{}.db", stem, schema))
        .to_string_lossy()
        .into_owned()
}

/// Model table and column names are interpolated into DDL, so only plain
/// identifiers are accepted.
fn quote_ident(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(StorageError::schema(format!(
            "Invalid identifier for model store: {:?}",
            name
        )));
    }
    Ok(format!("\"{}\"", name))
}

fn conversion_err(idx: usize, err: StorageError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn staged_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StagedRecord> {
    let segment: String = row.get(21)?;
    let customer_segment =
        CustomerSegment::from_str(&segment).map_err(|e| conversion_err(21, e))?;

    Ok(StagedRecord {
        customer_id: row.get(0)?,
        gender: row.get(1)?,
        senior_citizen: row.get(2)?,
        partner: row.get(3)?,
        dependents: row.get(4)?,
        tenure: row.get(5)?,
        phone_service: row.get(6)?,
        multiple_lines: row.get(7)?,
        internet_service: row.get(8)?,
        online_security: row.get(9)?,
        online_backup: row.get(10)?,
        device_protection: row.get(11)?,
        tech_support: row.get(12)?,
        streaming_tv: row.get(13)?,
        streaming_movies: row.get(14)?,
        contract_type: row.get(15)?,
        paperless_billing: row.get(16)?,
        payment_method: row.get(17)?,
        monthly_charges: row.get(18)?,
        total_charges: row.get(19)?,
        avg_monthly_revenue: row.get(20)?,
        customer_segment,
        churned: row.get(22)?,
        ingested_at: row.get(23)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_id: String = row.get(0)?;
    let status: String = row.get(2)?;

    Ok(RunRecord {
        run_id: parse_uuid(0, &run_id)?,
        dataset_id: row.get(1)?,
        status: RunStatus::from_str(&status).map_err(|e| conversion_err(2, e))?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        raw_checksum: row.get(5)?,
        raw_artifact: row.get(6)?,
        failed_stage: row.get(7)?,
        error: row.get(8)?,
        stages: Vec::new(),
    })
}

fn stage_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageEntry> {
    let status: String = row.get(1)?;
    let rows_in: i64 = row.get(2)?;
    let rows_out: i64 = row.get(3)?;

    Ok(StageEntry {
        stage: row.get(0)?,
        status: StageStatus::from_str(&status).map_err(|e| conversion_err(1, e))?,
        rows_in: rows_in.max(0) as u64,
        rows_out: rows_out.max(0) as u64,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        detail: row.get(6)?,
    })
}

fn load_stages(conn: &Connection, run_id: Uuid) -> Result<Vec<StageEntry>> {
    let mut stmt = conn.prepare(
        "SELECT stage, status, rows_in, rows_out, started_at, finished_at, detail
         FROM pipeline_stage_runs WHERE run_id = ?1 ORDER BY seq",
    )?;
    let stages = stmt
        .query_map(params![run_id.to_string()], stage_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(stages)
}

fn read_lock(conn: &Connection) -> Result<Option<RunLock>> {
    let lock = conn
        .query_row(
            "SELECT run_id, acquired_at FROM pipeline_lock WHERE id = 1",
            [],
            |row| {
                let run_id: String = row.get(0)?;
                Ok(RunLock {
                    run_id: parse_uuid(0, &run_id)?,
                    acquired_at: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(lock)
}

#[async_trait]
impl Warehouse for SqliteStore {
    async fn replace_staged(&self, records: &[StagedRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM silver.customers_staging", [])?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO silver.customers_staging ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                  ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                STAGED_COLUMNS
            ))?;

            for r in records {
                stmt.execute(params![
                    &r.customer_id,
                    &r.gender,
                    r.senior_citizen,
                    r.partner,
                    r.dependents,
                    r.tenure,
                    r.phone_service,
                    &r.multiple_lines,
                    &r.internet_service,
                    &r.online_security,
                    &r.online_backup,
                    &r.device_protection,
                    &r.tech_support,
                    &r.streaming_tv,
                    &r.streaming_movies,
                    &r.contract_type,
                    r.paperless_billing,
                    &r.payment_method,
                    r.monthly_charges,
                    r.total_charges,
                    r.avg_monthly_revenue,
                    r.customer_segment.as_str(),
                    r.churned,
                    r.ingested_at,
                ])?;
            }
        }

        tx.commit()?;
        Ok(records.len())
    }

    async fn load_staged(&self) -> Result<Vec<StagedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM silver.customers_staging ORDER BY customer_id",
            STAGED_COLUMNS
        ))?;
        let records = stmt
            .query_map([], staged_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn count_staged(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM silver.customers_staging", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    async fn replace_models(&self, tables: &[ModelTable]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for table in tables {
            let table_ident = quote_ident(&table.name)?;
            let calculated_at = table.calculated_at.to_rfc3339();

            let mut column_defs = Vec::new();
            for dim in &table.dimensions {
                column_defs.push(format!("{} TEXT NOT NULL", quote_ident(dim)?));
            }
            for measure in &table.measures {
                let sql_type = match measure.kind {
                    MeasureKind::Count => "INTEGER",
                    _ => "REAL",
                };
                column_defs.push(format!("{} {} NOT NULL", quote_ident(&measure.name)?, sql_type));
            }
            column_defs.push("calculated_at TEXT NOT NULL".to_string());

            tx.execute(&format!("DROP TABLE IF EXISTS gold.{}", table_ident), [])?;
            tx.execute(
                &format!("CREATE TABLE gold.{} ({})", table_ident, column_defs.join(", ")),
                [],
            )?;

            tx.execute(
                "DELETE FROM gold.model_catalog WHERE table_name = ?1",
                params![&table.name],
            )?;
            {
                let mut catalog = tx.prepare(
                    "INSERT INTO gold.model_catalog
                     (table_name, position, column_name, role, kind, calculated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                let mut position = 0i64;
                for dim in &table.dimensions {
                    catalog.execute(params![
                        &table.name,
                        position,
                        dim,
                        "dimension",
                        Option::<String>::None,
                        &calculated_at
                    ])?;
                    position += 1;
                }
                for measure in &table.measures {
                    catalog.execute(params![
                        &table.name,
                        position,
                        &measure.name,
                        "measure",
                        measure.kind.as_str(),
                        &calculated_at
                    ])?;
                    position += 1;
                }
            }

            let width = table.dimensions.len() + table.measures.len() + 1;
            let placeholders: Vec<String> = (1..=width).map(|i| format!("?{}", i)).collect();
            let mut insert = tx.prepare(&format!(
                "INSERT INTO gold.{} VALUES ({})",
                table_ident,
                placeholders.join(", ")
            ))?;

            for row in &table.rows {
                let mut values: Vec<Value> = Vec::with_capacity(width);
                values.extend(row.dimensions.iter().cloned().map(Value::Text));
                for (value, column) in row.measures.iter().zip(&table.measures) {
                    values.push(match column.kind {
                        MeasureKind::Count => Value::Integer(*value as i64),
                        _ => Value::Real(*value),
                    });
                }
                values.push(Value::Text(calculated_at.clone()));
                insert.execute(params_from_iter(values))?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    async fn load_model(&self, name: &str) -> Result<ModelTable> {
        let conn = self.conn.lock();
        let table_ident = quote_ident(name)?;

        let mut stmt = conn.prepare(
            "SELECT column_name, role, kind, calculated_at FROM gold.model_catalog
             WHERE table_name = ?1 ORDER BY position",
        )?;
        let catalog = stmt
            .query_map(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let Some((_, _, _, calculated_at)) = catalog.first() else {
            return Err(StorageError::table_not_found(format!("gold.{}", name)));
        };
        let calculated_at = DateTime::parse_from_rfc3339(calculated_at)
            .map_err(|e| StorageError::serialization(format!("Bad calculated_at: {}", e)))?
            .with_timezone(&Utc);

        let mut dimensions = Vec::new();
        let mut measures = Vec::new();
        for (column, role, kind, _) in &catalog {
            match (role.as_str(), kind) {
                ("dimension", _) => dimensions.push(column.clone()),
                ("measure", Some(kind)) => {
                    measures.push(MeasureColumn::new(column.clone(), MeasureKind::from_str(kind)?))
                }
                _ => {
                    return Err(StorageError::schema(format!(
                        "Catalog entry {}.{} has role {} without a usable kind",
                        name, column, role
                    )))
                }
            }
        }

        let mut table = ModelTable::new(name, dimensions, measures, calculated_at);
        let dim_count = table.dimensions.len();
        let measure_count = table.measures.len();

        let mut rows_stmt =
            conn.prepare(&format!("SELECT * FROM gold.{} ORDER BY rowid", table_ident))?;
        let rows = rows_stmt
            .query_map([], |row| {
                let mut dims = Vec::with_capacity(dim_count);
                for i in 0..dim_count {
                    dims.push(row.get::<_, String>(i)?);
                }
                let mut values = Vec::with_capacity(measure_count);
                for i in 0..measure_count {
                    values.push(row.get::<_, f64>(dim_count + i)?);
                }
                Ok((dims, values))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (dims, values) in rows {
            table.push_row(dims, values)?;
        }
        Ok(table)
    }

    async fn model_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT table_name FROM gold.model_catalog ORDER BY table_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }
}

#[async_trait]
impl RunLedger for SqliteStore {
    async fn try_acquire_lock(&self, run_id: Uuid) -> Result<LockAttempt> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let acquired_at = Utc::now();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO pipeline_lock (id, run_id, acquired_at) VALUES (1, ?1, ?2)",
            params![run_id.to_string(), acquired_at],
        )?;

        let attempt = if inserted == 1 {
            LockAttempt::Acquired(RunLock {
                run_id,
                acquired_at,
            })
        } else {
            let held = read_lock(&tx)?.ok_or_else(|| {
                StorageError::transaction("Lock row vanished inside an immediate transaction")
            })?;
            LockAttempt::Held(held)
        };

        tx.commit()?;
        Ok(attempt)
    }

    async fn release_lock(&self, run_id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM pipeline_lock WHERE id = 1 AND run_id = ?1",
            params![run_id.to_string()],
        )?;
        Ok(())
    }

    async fn force_release_lock(&self) -> Result<Option<RunLock>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let held = read_lock(&tx)?;
        tx.execute("DELETE FROM pipeline_lock WHERE id = 1", [])?;
        tx.commit()?;
        Ok(held)
    }

    async fn current_lock(&self) -> Result<Option<RunLock>> {
        let conn = self.conn.lock();
        read_lock(&conn)
    }

    async fn record_stage(&self, run_id: Uuid, entry: &StageEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pipeline_stage_runs
             (run_id, stage, status, rows_in, rows_out, started_at, finished_at, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id.to_string(),
                &entry.stage,
                entry.status.as_str(),
                entry.rows_in as i64,
                entry.rows_out as i64,
                entry.started_at,
                entry.finished_at,
                &entry.detail
            ],
        )?;
        Ok(())
    }

    async fn finish_run(&self, record: &RunRecord) -> Result<()> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM pipeline_runs WHERE run_id = ?1",
                params![record.run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StorageError::transaction(format!(
                "Run {} already finished",
                record.run_id
            )));
        }

        conn.execute(
            &format!(
                "INSERT INTO pipeline_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                RUN_COLUMNS
            ),
            params![
                record.run_id.to_string(),
                &record.dataset_id,
                record.status.as_str(),
                record.started_at,
                record.finished_at,
                &record.raw_checksum,
                &record.raw_artifact,
                &record.failed_stage,
                &record.error
            ],
        )?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord> {
        let conn = self.conn.lock();
        let mut record = conn
            .query_row(
                &format!("SELECT {} FROM pipeline_runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id.to_string()],
                run_from_row,
            )
            .optional()?
            .ok_or_else(|| StorageError::run_not_found(run_id))?;
        record.stages = load_stages(&conn, run_id)?;
        Ok(record)
    }

    async fn last_successful_run(&self, dataset_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pipeline_runs
                     WHERE dataset_id = ?1 AND status = ?2
                     ORDER BY finished_at DESC, rowid DESC LIMIT 1",
                    RUN_COLUMNS
                ),
                params![dataset_id, RunStatus::Complete.as_str()],
                run_from_row,
            )
            .optional()?;

        match record {
            Some(mut record) => {
                record.stages = load_stages(&conn, record.run_id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pipeline_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let mut records = stmt
            .query_map(params![limit as i64], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for record in &mut records {
            record.stages = load_stages(&conn, record.run_id)?;
        }
        Ok(records)
    }
}
