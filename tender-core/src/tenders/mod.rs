pub mod error;
pub mod models;
pub mod repository;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use models::{Analysis, Detail, Listing, ListingDraft, ListingFilter, StoreSummary};
pub use repository::TenderRepository;
pub use store::{SqliteTenderStore, SqliteTenderStoreBuilder};
