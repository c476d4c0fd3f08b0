use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// A result-table row as read from the portal, before the store stamps it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub title: String,
    pub number: String,
    pub status: String,
    pub publication_date: Option<String>,
    pub link: String,
}

impl ListingDraft {
    pub fn is_blank(&self) -> bool {
        self.title.is_empty()
            && self.number.is_empty()
            && self.status.is_empty()
            && self.link.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub title: String,
    pub number: String,
    pub status: String,
    pub publication_date: Option<String>,
    pub link: String,
    pub scraper_origin: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let scraped_at: Option<NaiveDateTime> = row.get("scraped_at")?;
        let processed_at: Option<NaiveDateTime> = row.get("processed_at")?;
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            number: row.get("number")?,
            status: row.get("status")?,
            publication_date: row.get("publication_date")?,
            link: row.get("link")?,
            scraper_origin: row.get("scraper_origin")?,
            scraped_at: scraped_at.map(|dt| Utc.from_utc_datetime(&dt)),
            processed: row.get::<_, i64>("processed")? != 0,
            processed_at: processed_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }

    pub fn draft(&self) -> ListingDraft {
        ListingDraft {
            title: self.title.clone(),
            number: self.number.clone(),
            status: self.status.clone(),
            publication_date: self.publication_date.clone(),
            link: self.link.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    pub tender_id: String,
    pub listing_id: Option<i64>,
    pub original_listing: Listing,
    pub full_content: String,
    pub classification: serde_json::Value,
    pub scraped_at: Option<DateTime<Utc>>,
}

impl Detail {
    pub fn new(
        listing: &Listing,
        full_content: impl Into<String>,
        classification: serde_json::Value,
    ) -> Self {
        Self {
            tender_id: listing.number.clone(),
            listing_id: Some(listing.id),
            original_listing: listing.clone(),
            full_content: full_content.into(),
            classification,
            scraped_at: Some(Utc::now()),
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let scraped_at: Option<NaiveDateTime> = row.get("scraped_at")?;
        let original: String = row.get("original_listing")?;
        let classification: String = row.get("classification")?;
        Ok(Self {
            tender_id: row.get("tender_id")?,
            listing_id: row.get("listing_id")?,
            original_listing: serde_json::from_str(&original).map_err(json_column_error)?,
            full_content: row.get("full_content")?,
            classification: serde_json::from_str(&classification).map_err(json_column_error)?,
            scraped_at: scraped_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

/// One stored re-analysis of a detail under a named prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub tender_id: String,
    pub prompt_name: String,
    pub qualifies: bool,
    pub analysis: serde_json::Value,
    pub source_listing: ListingDraft,
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl Analysis {
    pub fn new(
        detail: &Detail,
        prompt_name: impl Into<String>,
        qualifies: bool,
        analysis: serde_json::Value,
    ) -> Self {
        Self {
            tender_id: detail.tender_id.clone(),
            prompt_name: prompt_name.into(),
            qualifies,
            analysis,
            source_listing: detail.original_listing.draft(),
            analyzed_at: Some(Utc::now()),
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let analyzed_at: Option<NaiveDateTime> = row.get("analyzed_at")?;
        let analysis: String = row.get("analysis")?;
        let source: String = row.get("source_listing")?;
        Ok(Self {
            tender_id: row.get("tender_id")?,
            prompt_name: row.get("prompt_name")?,
            qualifies: row.get::<_, i64>("qualifies")? != 0,
            analysis: serde_json::from_str(&analysis).map_err(json_column_error)?,
            source_listing: serde_json::from_str(&source).map_err(json_column_error)?,
            analyzed_at: analyzed_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

fn json_column_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

#[derive(Debug, Clone, Default)]
pub struct ListingFilter {
    pub processed: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub listings: i64,
    pub unprocessed: i64,
    pub processed: i64,
    pub details: i64,
    pub analyses: i64,
}
