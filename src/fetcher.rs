use std::time::Duration;

use tracing::{info, warn};

use crate::config::RunConfig;
use crate::model::Card;
use crate::retry::RetryPolicy;
use crate::source::{CardSource, LookupReply, PageReply, SearchReply};

/// Terminal classification of one page attempt, matched exhaustively by the
/// orchestrator.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Definitive page. Empty means the set has been fully paged.
    Page(Vec<Card>),
    /// Temporary trouble; the same page is retried on a later run.
    Retry,
    /// The set is confirmed gone upstream; never page it again today.
    Skip,
}

/// Performs one bounded, size-degrading attempt to retrieve one page.
/// Upstream intermittently rejects large page sizes, so besides temporal
/// backoff within a size the fetcher walks the configured size ladder
/// largest-first.
pub struct PageFetcher<'a, S: CardSource + ?Sized> {
    source: &'a S,
    cfg: &'a RunConfig,
}

impl<'a, S: CardSource + ?Sized> PageFetcher<'a, S> {
    pub fn new(source: &'a S, cfg: &'a RunConfig) -> Self {
        Self { source, cfg }
    }

    pub async fn fetch(&self, set_id: &str, page: u32) -> FetchOutcome {
        let policy = self.cfg.transient_backoff();
        for &size in &self.cfg.page_sizes {
            for attempt in policy.attempts() {
                match self.source.cards_page(set_id, page, size).await {
                    Ok(PageReply::Page(cards)) => return FetchOutcome::Page(cards),
                    Ok(PageReply::Throttled(status)) => {
                        let wait = policy.delay_for(attempt);
                        warn!(
                            set_id,
                            page,
                            size,
                            status,
                            wait_s = wait.as_secs_f64(),
                            "throttled; backing off"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    Ok(PageReply::NotFound) => {
                        let resolver = ExistenceResolver::new(self.source);
                        if !resolver.exists(set_id).await {
                            warn!(set_id, "confirmed missing upstream; skipping set");
                            return FetchOutcome::Skip;
                        }
                        info!(set_id, page, size, "404 on cards but set exists; deferring");
                        return FetchOutcome::Retry;
                    }
                    Ok(PageReply::Unexpected(status)) => {
                        // Fail fast: an unknown status is unlikely to clear
                        // within this run's budget.
                        warn!(set_id, page, size, status, "unexpected status; deferring");
                        return FetchOutcome::Retry;
                    }
                    Err(e) => {
                        let wait = policy.delay_for(attempt);
                        warn!(
                            set_id,
                            page,
                            size,
                            error = %e,
                            wait_s = wait.as_secs_f64(),
                            "request failed; backing off"
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
            info!(
                set_id,
                page,
                from_size = size,
                "retry budget exhausted; falling back to smaller page size"
            );
        }
        FetchOutcome::Retry
    }
}

/// Authoritative existence check for a set, consulted only after an
/// ambiguous 404 on the cards listing.
pub struct ExistenceResolver<'a, S: CardSource + ?Sized> {
    source: &'a S,
    policy: RetryPolicy,
}

impl<'a, S: CardSource + ?Sized> ExistenceResolver<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            policy: RetryPolicy::linear(3, Duration::from_millis(500)),
        }
    }

    /// Returns false only when a direct 404 and an empty search agree that
    /// the set is gone. Every uncertain signal counts as "exists" so a set
    /// is never permanently skipped on a transient error.
    pub async fn exists(&self, set_id: &str) -> bool {
        for attempt in self.policy.attempts() {
            match self.source.set_by_id(set_id).await {
                Ok(LookupReply::Found) => return true,
                Ok(LookupReply::Missing) => break,
                Ok(LookupReply::Other(_)) | Err(_) => {}
            }
            tokio::time::sleep(self.policy.delay_for(attempt)).await;
        }
        match self.source.search_set(set_id).await {
            Ok(SearchReply::Matches(found)) => found,
            Ok(SearchReply::Failed(_)) | Err(_) => true,
        }
    }
}
