//! SQLite implementation of [`RecordStore`].
//!
//! Migrations under `./migrations` are embedded at compile time and run by
//! [`SqliteRecordStore::connect`]. Queries use the runtime-checked
//! `sqlx::query` form so no `DATABASE_URL` is needed to build.

use std::collections::BTreeMap;
use std::str::FromStr;

use arforge_core::model::{FormatUrls, LoadTimeEstimate};
use arforge_core::{
    Asset, ConversionJob, JobStatus, PipelineError, RecordStore, TargetFormat, ValidationOutcome,
    ValidationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteQueryResult};
use tracing::warn;

use super::storage_error;

const ASSET_COLUMNS: &str = "id, project_id, original_filename, original_format, original_size, \
     original_uri, poly_count, material_count, texture_count, bounding_box, dimensions, \
     validation_status, validation_errors, auto_fixes, load_time, format_urls, lod_urls, \
     recommended_lod, created_at, updated_at";

const JOB_COLUMNS: &str = "id, asset_id, source_format, target_format, status, attempts, \
     processing_ms, error, output_uri, started_at, created_at, updated_at";

/// SQLite-backed asset and job store.
#[derive(Clone, Debug)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// In-memory URLs (`sqlite::memory:`) get a single long-lived connection,
    /// since every connection would otherwise see its own empty database.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut pool = SqlitePoolOptions::new();
        pool = if in_memory {
            pool.max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            pool.max_connections(5)
        };
        let pool = pool.connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Distinguish "no such job" from "job already terminal" after an update
    /// that touched no rows.
    async fn check_job_update(
        &self,
        id: &str,
        result: SqliteQueryResult,
    ) -> Result<(), PipelineError> {
        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_job(id).await? {
            Some(job) => {
                warn!(job_id = id, status = %job.status, "ignoring update to terminal job");
                Ok(())
            }
            None => Err(PipelineError::not_found("conversion job", id)),
        }
    }

    fn asset_updated(id: &str, result: SqliteQueryResult) -> Result<(), PipelineError> {
        if result.rows_affected() == 0 {
            Err(PipelineError::not_found("asset", id))
        } else {
            Ok(())
        }
    }
}

// ── row mapping ──────────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct AssetRow {
    id: String,
    project_id: String,
    original_filename: String,
    original_format: String,
    original_size: i64,
    original_uri: String,
    poly_count: i64,
    material_count: i64,
    texture_count: i64,
    bounding_box: Option<String>,
    dimensions: Option<String>,
    validation_status: String,
    validation_errors: String,
    auto_fixes: String,
    load_time: Option<String>,
    format_urls: String,
    lod_urls: String,
    recommended_lod: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<AssetRow> for Asset {
    type Error = PipelineError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        Ok(Asset {
            original_size: unsigned("original_size", row.original_size)?,
            poly_count: unsigned("poly_count", row.poly_count)?,
            material_count: narrow("material_count", row.material_count)?,
            texture_count: narrow("texture_count", row.texture_count)?,
            bounding_box: row.bounding_box.as_deref().map(from_json).transpose()?,
            dimensions: row.dimensions.as_deref().map(from_json).transpose()?,
            validation_status: parse_column("validation_status", &row.validation_status)?,
            validation_errors: from_json(&row.validation_errors)?,
            auto_fixes: from_json(&row.auto_fixes)?,
            load_time: row
                .load_time
                .as_deref()
                .map(from_json::<LoadTimeEstimate>)
                .transpose()?,
            format_urls: from_json::<FormatUrls>(&row.format_urls)?,
            lod_urls: from_json(&row.lod_urls)?,
            recommended_lod: row.recommended_lod,
            created_at: timestamp(&row.created_at)?,
            updated_at: timestamp(&row.updated_at)?,
            id: row.id,
            project_id: row.project_id,
            original_filename: row.original_filename,
            original_format: row.original_format,
            original_uri: row.original_uri,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    asset_id: String,
    source_format: String,
    target_format: String,
    status: String,
    attempts: i64,
    processing_ms: Option<i64>,
    error: Option<String>,
    output_uri: Option<String>,
    started_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JobRow> for ConversionJob {
    type Error = PipelineError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ConversionJob {
            target_format: parse_column::<TargetFormat>("target_format", &row.target_format)?,
            status: parse_column::<JobStatus>("status", &row.status)?,
            attempts: narrow("attempts", row.attempts)?,
            processing_ms: row
                .processing_ms
                .map(|ms| unsigned("processing_ms", ms))
                .transpose()?,
            started_at: row.started_at.as_deref().map(timestamp).transpose()?,
            created_at: timestamp(&row.created_at)?,
            updated_at: timestamp(&row.updated_at)?,
            id: row.id,
            asset_id: row.asset_id,
            source_format: row.source_format,
            error: row.error,
            output_uri: row.output_uri,
        })
    }
}

fn now() -> String {
    format_time(Utc::now())
}

/// Fixed-width so that text ordering matches time ordering.
fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp(s: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PipelineError::Storage(format!("invalid timestamp '{s}': {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T, PipelineError> {
    Ok(serde_json::from_str(s)?)
}

fn parse_column<T: FromStr>(column: &str, value: &str) -> Result<T, PipelineError> {
    value
        .parse()
        .map_err(|_| PipelineError::Storage(format!("invalid {column} '{value}'")))
}

fn unsigned(column: &str, value: i64) -> Result<u64, PipelineError> {
    u64::try_from(value).map_err(|_| PipelineError::Storage(format!("negative {column}: {value}")))
}

fn narrow(column: &str, value: i64) -> Result<u32, PipelineError> {
    u32::try_from(value).map_err(|_| PipelineError::Storage(format!("{column} out of range: {value}")))
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ── RecordStore ──────────────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_asset(&self, asset: Asset) -> Result<(), PipelineError> {
        sqlx::query(&format!(
            "INSERT INTO assets ({ASSET_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        ))
        .bind(&asset.id)
        .bind(&asset.project_id)
        .bind(&asset.original_filename)
        .bind(&asset.original_format)
        .bind(signed(asset.original_size))
        .bind(&asset.original_uri)
        .bind(signed(asset.poly_count))
        .bind(i64::from(asset.material_count))
        .bind(i64::from(asset.texture_count))
        .bind(asset.bounding_box.as_ref().map(to_json).transpose()?)
        .bind(asset.dimensions.as_ref().map(to_json).transpose()?)
        .bind(asset.validation_status.as_ref())
        .bind(to_json(&asset.validation_errors)?)
        .bind(to_json(&asset.auto_fixes)?)
        .bind(asset.load_time.as_ref().map(to_json).transpose()?)
        .bind(to_json(&asset.format_urls)?)
        .bind(to_json(&asset.lod_urls)?)
        .bind(&asset.recommended_lod)
        .bind(format_time(asset.created_at))
        .bind(format_time(asset.updated_at))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>, PipelineError> {
        let row: Option<AssetRow> =
            sqlx::query_as(&format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
        row.map(Asset::try_from).transpose()
    }

    async fn set_validation_status(
        &self,
        id: &str,
        status: ValidationStatus,
    ) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "UPDATE assets SET validation_status = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(status.as_ref())
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Self::asset_updated(id, result)
    }

    async fn record_validation(
        &self,
        id: &str,
        outcome: ValidationOutcome,
    ) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "UPDATE assets SET validation_status = ?1, validation_errors = ?2, load_time = ?3, \
             updated_at = ?4 WHERE id = ?5",
        )
        .bind(outcome.status.as_ref())
        .bind(to_json(&outcome.errors)?)
        .bind(to_json(&outcome.load_time)?)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Self::asset_updated(id, result)
    }

    async fn set_format_url(
        &self,
        id: &str,
        target: TargetFormat,
        uri: &str,
    ) -> Result<(), PipelineError> {
        // json_set rewrites only the named key, so concurrent jobs on the
        // same asset keep each other's slots.
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let result = sqlx::query(
            "UPDATE assets SET format_urls = json_set(format_urls, ?1, ?2), updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(format!("$.{target}"))
        .bind(uri)
        .bind(now())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;
        Self::asset_updated(id, result)?;
        tx.commit().await.map_err(storage_error)
    }

    async fn set_lod_urls(
        &self,
        id: &str,
        lods: BTreeMap<String, String>,
        recommended: Option<String>,
    ) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "UPDATE assets SET lod_urls = ?1, recommended_lod = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(to_json(&lods)?)
        .bind(recommended)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Self::asset_updated(id, result)
    }

    async fn insert_job(&self, job: ConversionJob) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM assets WHERE id = ?1")
            .bind(&job.asset_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_error)?;
        if exists.is_none() {
            return Err(PipelineError::not_found("asset", &job.asset_id));
        }
        sqlx::query(&format!(
            "INSERT INTO conversion_jobs ({JOB_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ))
        .bind(&job.id)
        .bind(&job.asset_id)
        .bind(&job.source_format)
        .bind(job.target_format.as_ref())
        .bind(job.status.as_ref())
        .bind(i64::from(job.attempts))
        .bind(job.processing_ms.map(signed))
        .bind(&job.error)
        .bind(&job.output_uri)
        .bind(job.started_at.map(format_time))
        .bind(format_time(job.created_at))
        .bind(format_time(job.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)
    }

    async fn get_job(&self, id: &str) -> Result<Option<ConversionJob>, PipelineError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM conversion_jobs WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
        row.map(ConversionJob::try_from).transpose()
    }

    async fn jobs_for_asset(&self, asset_id: &str) -> Result<Vec<ConversionJob>, PipelineError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM conversion_jobs WHERE asset_id = ?1 \
             ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        rows.into_iter().map(ConversionJob::try_from).collect()
    }

    async fn mark_job_processing(&self, id: &str, attempt: u32) -> Result<(), PipelineError> {
        let now = now();
        let result = sqlx::query(
            "UPDATE conversion_jobs SET status = 'PROCESSING', attempts = ?1, \
             started_at = COALESCE(started_at, ?2), updated_at = ?2 \
             WHERE id = ?3 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(i64::from(attempt))
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        self.check_job_update(id, result).await
    }

    async fn record_job_error(&self, id: &str, message: &str) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "UPDATE conversion_jobs SET error = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(message)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        self.check_job_update(id, result).await
    }

    async fn complete_job(
        &self,
        id: &str,
        output_uri: &str,
        processing_ms: u64,
    ) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "UPDATE conversion_jobs SET status = 'COMPLETED', output_uri = ?1, processing_ms = ?2, \
             updated_at = ?3 WHERE id = ?4 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(output_uri)
        .bind(signed(processing_ms))
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        self.check_job_update(id, result).await
    }

    async fn fail_job(
        &self,
        id: &str,
        message: &str,
        processing_ms: Option<u64>,
    ) -> Result<(), PipelineError> {
        let result = sqlx::query(
            "UPDATE conversion_jobs SET status = 'FAILED', error = ?1, processing_ms = ?2, \
             updated_at = ?3 WHERE id = ?4 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(message)
        .bind(processing_ms.map(signed))
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        self.check_job_update(id, result).await
    }
}
