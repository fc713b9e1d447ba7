use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::model::{CardPriceRow, Progress};

/// One ledger row as read back for the end-of-run summary.
#[derive(Debug, Clone)]
pub struct ProgressRow {
    pub set_id: String,
    pub last_page_done: i32,
    pub done: bool,
}

/// Persistence backend: the read-only set list, the price-fact table and the
/// progress ledger. Implemented by `util::db::Db` for Postgres and by
/// in-memory doubles in tests.
#[async_trait]
pub trait Store: Send + Sync {
    /// All set ids, ascending. Enumerated once at run start.
    async fn set_ids(&self) -> Result<Vec<String>>;

    /// Ledger entry for (run date, set id), created with defaults on first
    /// touch.
    async fn read_or_init_progress(&self, run_date: NaiveDate, set_id: &str) -> Result<Progress>;

    /// Partial upsert of the ledger entry: only the supplied fields change.
    async fn patch_progress(
        &self,
        run_date: NaiveDate,
        set_id: &str,
        page: Option<i32>,
        done: Option<bool>,
    ) -> Result<()>;

    /// Merge-on-conflict write keyed by (card_id, variant, date).
    async fn upsert_card_prices(&self, rows: &[CardPriceRow]) -> Result<()>;

    /// Count of price rows stored for the given date.
    async fn price_count_for_date(&self, date: NaiveDate) -> Result<i64>;

    /// All ledger rows for the given run date.
    async fn progress_for_date(&self, date: NaiveDate) -> Result<Vec<ProgressRow>>;
}
