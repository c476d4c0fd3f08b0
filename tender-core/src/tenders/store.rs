use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};

use crate::sqlite::configure_connection;

use super::models::{Analysis, Detail, Listing, ListingDraft, ListingFilter, StoreSummary};
use super::{StoreError, StoreResult};

const TENDER_SCHEMA: &str = include_str!("../../../sql/tenders.sql");

#[derive(Debug, Clone)]
pub struct SqliteTenderStoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteTenderStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteTenderStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteTenderStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        Ok(SqliteTenderStore { path, flags })
    }
}

/// Listing and detail tables on one SQLite file. Every call opens its own
/// connection, so clones can be handed to independent pipelines.
#[derive(Debug, Clone)]
pub struct SqliteTenderStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteTenderStore {
    pub fn builder() -> SqliteTenderStoreBuilder {
        SqliteTenderStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteTenderStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(TENDER_SCHEMA)?;
        Ok(())
    }

    /// Inserts the drafts that are not yet stored and returns how many were
    /// new. Duplicates, including duplicates within `drafts`, are skipped by
    /// the table's unique key rather than a prior lookup.
    pub fn insert_listings(&self, drafts: &[ListingDraft], origin: &str) -> StoreResult<usize> {
        if drafts.is_empty() {
            return Ok(0);
        }
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().naive_utc();
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tender_listings (
                    title, number, status, publication_date, link, scraper_origin, scraped_at, processed
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
                ON CONFLICT (number, title, status, link) DO NOTHING",
            )?;
            for draft in drafts {
                inserted += stmt.execute(params![
                    draft.title,
                    draft.number,
                    draft.status,
                    draft.publication_date,
                    draft.link,
                    origin,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn fetch_listing(&self, id: i64) -> StoreResult<Listing> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT * FROM tender_listings WHERE id = ?1",
            [id],
            Listing::from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound { id })
    }

    pub fn unprocessed_listings(&self) -> StoreResult<Vec<Listing>> {
        self.list_listings(&ListingFilter {
            processed: Some(false),
            limit: None,
        })
    }

    pub fn list_listings(&self, filter: &ListingFilter) -> StoreResult<Vec<Listing>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM tender_listings");
        let mut values: Vec<Value> = Vec::new();
        if let Some(processed) = filter.processed {
            query.push_str(" WHERE processed = ?");
            values.push(Value::Integer(i64::from(processed)));
        }
        query.push_str(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            values.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut listings = Vec::new();
        while let Some(row) = rows.next()? {
            listings.push(Listing::from_row(row)?);
        }
        Ok(listings)
    }

    /// Flips `processed` to true. Returns false when the listing was
    /// already processed; there is no way back to false.
    pub fn mark_processed(&self, id: i64) -> StoreResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE tender_listings SET processed = 1, processed_at = ?1
             WHERE id = ?2 AND processed = 0",
            params![Utc::now().naive_utc(), id],
        )?;
        if affected > 0 {
            return Ok(true);
        }
        let exists = conn
            .query_row("SELECT 1 FROM tender_listings WHERE id = ?1", [id], |_| {
                Ok(())
            })
            .optional()?;
        match exists {
            Some(()) => Ok(false),
            None => Err(StoreError::NotFound { id }),
        }
    }

    /// Returns false when a detail for the same tender id already exists.
    pub fn save_detail(&self, detail: &Detail) -> StoreResult<bool> {
        let conn = self.open()?;
        let original = serde_json::to_string(&detail.original_listing)?;
        let classification = serde_json::to_string(&detail.classification)?;
        let scraped_at = detail.scraped_at.unwrap_or_else(Utc::now).naive_utc();
        let affected = conn.execute(
            "INSERT INTO tender_details (
                tender_id, listing_id, original_listing, full_content, classification, scraped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (tender_id) DO NOTHING",
            params![
                detail.tender_id,
                detail.listing_id,
                original,
                detail.full_content,
                classification,
                scraped_at,
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn details(&self) -> StoreResult<Vec<Detail>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM tender_details ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut details = Vec::new();
        while let Some(row) = rows.next()? {
            details.push(Detail::from_row(row)?);
        }
        Ok(details)
    }

    pub fn summary(&self) -> StoreResult<StoreSummary> {
        let conn = self.open()?;
        let (listings, processed): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(processed), 0) FROM tender_listings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let details: i64 =
            conn.query_row("SELECT COUNT(*) FROM tender_details", [], |row| row.get(0))?;
        let analyses: i64 =
            conn.query_row("SELECT COUNT(*) FROM tender_analyses", [], |row| row.get(0))?;
        Ok(StoreSummary {
            listings,
            unprocessed: listings - processed,
            processed,
            details,
            analyses,
        })
    }

    pub fn has_analysis(&self, tender_id: &str, prompt_name: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM tender_analyses WHERE tender_id = ?1 AND prompt_name = ?2",
                params![tender_id, prompt_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns false when the tender was already analyzed under the same
    /// prompt; the stored analysis is kept.
    pub fn save_analysis(&self, analysis: &Analysis) -> StoreResult<bool> {
        let conn = self.open()?;
        let record = serde_json::to_string(&analysis.analysis)?;
        let source = serde_json::to_string(&analysis.source_listing)?;
        let analyzed_at = analysis.analyzed_at.unwrap_or_else(Utc::now).naive_utc();
        let affected = conn.execute(
            "INSERT INTO tender_analyses (
                tender_id, prompt_name, qualifies, analysis, source_listing, analyzed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (tender_id, prompt_name) DO NOTHING",
            params![
                analysis.tender_id,
                analysis.prompt_name,
                analysis.qualifies,
                record,
                source,
                analyzed_at,
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn analyses(&self, prompt_name: Option<&str>) -> StoreResult<Vec<Analysis>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM tender_analyses
             WHERE ?1 IS NULL OR prompt_name = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([prompt_name])?;
        let mut analyses = Vec::new();
        while let Some(row) = rows.next()? {
            analyses.push(Analysis::from_row(row)?);
        }
        Ok(analyses)
    }
}
