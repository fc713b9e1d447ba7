use std::time::Duration;

use tracing::warn;

use crate::model::CardPriceRow;
use crate::retry::RetryPolicy;
use crate::store::Store;

/// Durable price writer. Retries with exponential backoff, then deliberately
/// swallows a batch that keeps failing: one set's bad batch must not abort
/// the whole multi-set run. The lost batch is not re-fetched later because
/// page advancement has already happened by then.
pub struct PriceSink<'a, S: Store + ?Sized> {
    store: &'a S,
    policy: RetryPolicy,
    post_batch_delay: Duration,
}

impl<'a, S: Store + ?Sized> PriceSink<'a, S> {
    pub fn new(store: &'a S, policy: RetryPolicy, post_batch_delay: Duration) -> Self {
        Self {
            store,
            policy,
            post_batch_delay,
        }
    }

    pub async fn upsert(&self, rows: &[CardPriceRow]) {
        if rows.is_empty() {
            return;
        }
        match self
            .policy
            .run(|| async { self.store.upsert_card_prices(rows).await })
            .await
        {
            Ok(()) => tokio::time::sleep(self.post_batch_delay).await,
            Err(e) => warn!(rows = rows.len(), error = %e, "price upsert failed; dropping batch"),
        }
    }
}
