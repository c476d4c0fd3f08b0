use async_trait::async_trait;

use super::models::{Analysis, Detail, Listing, ListingDraft};
use super::store::SqliteTenderStore;
use super::StoreResult;

/// Persistence seam shared by the listing crawl, the detail queue and the
/// correction pass.
#[async_trait]
pub trait TenderRepository: Send + Sync {
    async fn insert_listings(&self, drafts: Vec<ListingDraft>, origin: &str)
        -> StoreResult<usize>;
    async fn unprocessed_listings(&self) -> StoreResult<Vec<Listing>>;
    async fn mark_processed(&self, id: i64) -> StoreResult<bool>;
    async fn save_detail(&self, detail: Detail) -> StoreResult<bool>;
    async fn details(&self) -> StoreResult<Vec<Detail>>;
    async fn has_analysis(&self, tender_id: &str, prompt_name: &str) -> StoreResult<bool>;
    async fn save_analysis(&self, analysis: Analysis) -> StoreResult<bool>;
}

#[async_trait]
impl TenderRepository for SqliteTenderStore {
    async fn insert_listings(
        &self,
        drafts: Vec<ListingDraft>,
        origin: &str,
    ) -> StoreResult<usize> {
        let store = self.clone();
        let origin = origin.to_string();
        tokio::task::spawn_blocking(move || store.insert_listings(&drafts, &origin)).await?
    }

    async fn unprocessed_listings(&self) -> StoreResult<Vec<Listing>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.unprocessed_listings()).await?
    }

    async fn mark_processed(&self, id: i64) -> StoreResult<bool> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.mark_processed(id)).await?
    }

    async fn save_detail(&self, detail: Detail) -> StoreResult<bool> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save_detail(&detail)).await?
    }

    async fn details(&self) -> StoreResult<Vec<Detail>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.details()).await?
    }

    async fn has_analysis(&self, tender_id: &str, prompt_name: &str) -> StoreResult<bool> {
        let store = self.clone();
        let tender_id = tender_id.to_string();
        let prompt_name = prompt_name.to_string();
        tokio::task::spawn_blocking(move || store.has_analysis(&tender_id, &prompt_name)).await?
    }

    async fn save_analysis(&self, analysis: Analysis) -> StoreResult<bool> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save_analysis(&analysis)).await?
    }
}
