use std::collections::BTreeSet;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::fetcher::{FetchOutcome, PageFetcher};
use crate::projector::rows_from_card;
use crate::sink::PriceSink;
use crate::source::CardSource;
use crate::store::Store;

/// Terminal state of one set within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Fully paged today.
    Done,
    /// Confirmed absent upstream; permanently skipped for the run date.
    Skipped,
    /// Temporary trouble; the same page is retried by a later invocation.
    Deferred,
    /// The ledger already had done=true; nothing was fetched.
    AlreadyDone,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_date: NaiveDate,
    pub total_cards_seen: usize,
    pub total_price_rows: usize,
    /// Best-effort count of today's stored rows; None when the count failed.
    pub db_rows_today: Option<i64>,
    pub sets_done: Vec<String>,
    pub sets_skipped: Vec<String>,
    pub sets_deferred: Vec<String>,
    /// Recomputed from the ledger, which is authoritative: sets that were
    /// short-circuited as already-done never enter the in-run lists above.
    pub done_in_ledger: Vec<String>,
    pub not_done_in_ledger: Vec<String>,
    pub remaining: Vec<String>,
}

impl RunReport {
    fn new(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            total_cards_seen: 0,
            total_price_rows: 0,
            db_rows_today: None,
            sets_done: Vec::new(),
            sets_skipped: Vec::new(),
            sets_deferred: Vec::new(),
            done_in_ledger: Vec::new(),
            not_done_in_ledger: Vec::new(),
            remaining: Vec::new(),
        }
    }

    fn push_list(out: &mut String, title: &str, items: &[String], limit: usize) {
        let uniq: BTreeSet<&String> = items.iter().collect();
        let _ = writeln!(out, "{title}: {}", uniq.len());
        if !uniq.is_empty() {
            let preview: Vec<&str> = uniq.iter().take(limit).map(|s| s.as_str()).collect();
            let suffix = if uniq.len() > limit { " ..." } else { "" };
            let _ = writeln!(out, "  {}{}", preview.join(", "), suffix);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("\n================ SUMMARY ================\n\n");
        let _ = writeln!(out, "run date: {}", self.run_date);
        let _ = writeln!(out, "cards seen this run: {}", self.total_cards_seen);
        let _ = writeln!(out, "price rows prepared this run: {}", self.total_price_rows);
        if let Some(n) = self.db_rows_today {
            let _ = writeln!(out, "price rows stored for today: {n}");
        }
        out.push('\n');
        // Runs that only verified already-done sets have empty in-run lists;
        // fall back to the ledger's view like the counts above.
        let done = if self.sets_done.is_empty() {
            &self.done_in_ledger
        } else {
            &self.sets_done
        };
        let deferred = if self.sets_deferred.is_empty() {
            &self.not_done_in_ledger
        } else {
            &self.sets_deferred
        };
        Self::push_list(&mut out, "sets done today", done, 25);
        Self::push_list(&mut out, "sets skipped (absent upstream)", &self.sets_skipped, 25);
        Self::push_list(&mut out, "sets deferred to next run", deferred, 25);
        Self::push_list(&mut out, "sets remaining", &self.remaining, 25);
        out.push_str("\n================ END SUMMARY ================\n");
        out
    }
}

/// Drive every set to a terminal state, then recompute the day's totals from
/// the ledger. Strictly sequential: one set, one page at a time, with
/// deliberate sleeps between pages to respect upstream rate limits.
pub async fn run_daily_update<S, C>(
    store: &S,
    source: &C,
    cfg: &RunConfig,
    run_date: NaiveDate,
) -> Result<RunReport>
where
    S: Store + ?Sized,
    C: CardSource + ?Sized,
{
    let set_ids = store.set_ids().await.context("enumerating sets")?;
    info!(sets = set_ids.len(), %run_date, "starting daily price update");

    let fetcher = PageFetcher::new(source, cfg);
    let sink = PriceSink::new(store, cfg.transient_backoff(), cfg.post_batch_delay);
    let mut report = RunReport::new(run_date);

    for set_id in &set_ids {
        let outcome = match run_set(store, &fetcher, &sink, cfg, run_date, set_id, &mut report).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // A ledger write failure must not take down the other sets.
                warn!(set_id, error = %e, "set aborted by storage failure; deferring");
                SetOutcome::Deferred
            }
        };
        match outcome {
            SetOutcome::Done => report.sets_done.push(set_id.clone()),
            SetOutcome::Skipped => report.sets_skipped.push(set_id.clone()),
            SetOutcome::Deferred => report.sets_deferred.push(set_id.clone()),
            SetOutcome::AlreadyDone => {}
        }
    }

    match store.price_count_for_date(run_date).await {
        Ok(n) => report.db_rows_today = Some(n),
        Err(e) => warn!(error = %e, "could not count today's stored rows"),
    }

    let ledger = store.progress_for_date(run_date).await?;
    let done: BTreeSet<String> = ledger
        .iter()
        .filter(|r| r.done)
        .map(|r| r.set_id.clone())
        .collect();
    report.not_done_in_ledger = ledger
        .iter()
        .filter(|r| !r.done)
        .map(|r| r.set_id.clone())
        .collect();
    report.remaining = set_ids
        .iter()
        .filter(|id| !done.contains(*id))
        .cloned()
        .collect();
    report.done_in_ledger = done.into_iter().collect();
    Ok(report)
}

/// Per-set state machine: resume at last_page_done + 1 and page until the
/// set is done, skipped or deferred. The batch upsert always lands before
/// the ledger patch, so an interruption never marks unpersisted work done.
async fn run_set<S, C>(
    store: &S,
    fetcher: &PageFetcher<'_, C>,
    sink: &PriceSink<'_, S>,
    cfg: &RunConfig,
    run_date: NaiveDate,
    set_id: &str,
    report: &mut RunReport,
) -> Result<SetOutcome>
where
    S: Store + ?Sized,
    C: CardSource + ?Sized,
{
    let progress = store.read_or_init_progress(run_date, set_id).await?;
    if progress.done {
        info!(set_id, "already done for today; skipping");
        return Ok(SetOutcome::AlreadyDone);
    }

    let mut page = progress.last_page_done.max(0) as u32 + 1;
    info!(set_id, page, "resuming");

    loop {
        match fetcher.fetch(set_id, page).await {
            FetchOutcome::Skip => {
                // The page number is immaterial for a set that will never be
                // paged again today; reset it to 0.
                store
                    .patch_progress(run_date, set_id, Some(0), Some(true))
                    .await?;
                return Ok(SetOutcome::Skipped);
            }
            FetchOutcome::Retry => {
                info!(set_id, page, "temporary failure; will retry next run");
                return Ok(SetOutcome::Deferred);
            }
            FetchOutcome::Page(cards) if cards.is_empty() => {
                store
                    .patch_progress(run_date, set_id, Some(page as i32 - 1), Some(true))
                    .await?;
                info!(set_id, last_page_done = page - 1, "set complete");
                return Ok(SetOutcome::Done);
            }
            FetchOutcome::Page(cards) => {
                report.total_cards_seen += cards.len();
                let mut batch = Vec::new();
                for card in &cards {
                    batch.extend(rows_from_card(card, run_date));
                }
                sink.upsert(&batch).await;
                report.total_price_rows += batch.len();
                store
                    .patch_progress(run_date, set_id, Some(page as i32), Some(false))
                    .await?;
                info!(
                    set_id,
                    page,
                    cards = cards.len(),
                    price_rows = batch.len(),
                    run_total = report.total_price_rows,
                    "page ingested"
                );
                page += 1;
                tokio::time::sleep(cfg.between_pages_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Card, CardPriceRow, Progress};
    use crate::source::{LookupReply, PageReply, SearchReply};
    use crate::store::ProgressRow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        sets: Vec<String>,
        prices: Mutex<BTreeMap<(String, String, NaiveDate), CardPriceRow>>,
        progress: Mutex<BTreeMap<(NaiveDate, String), Progress>>,
        fail_upserts: bool,
        fail_patches_for: Option<String>,
    }

    impl MemoryStore {
        fn with_sets(sets: &[&str]) -> Self {
            Self {
                sets: sets.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn progress_of(&self, date: NaiveDate, set_id: &str) -> Option<Progress> {
            self.progress
                .lock()
                .unwrap()
                .get(&(date, set_id.to_string()))
                .copied()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn set_ids(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.sets.clone())
        }

        async fn read_or_init_progress(
            &self,
            run_date: NaiveDate,
            set_id: &str,
        ) -> anyhow::Result<Progress> {
            Ok(*self
                .progress
                .lock()
                .unwrap()
                .entry((run_date, set_id.to_string()))
                .or_default())
        }

        async fn patch_progress(
            &self,
            run_date: NaiveDate,
            set_id: &str,
            page: Option<i32>,
            done: Option<bool>,
        ) -> anyhow::Result<()> {
            if self.fail_patches_for.as_deref() == Some(set_id) {
                anyhow::bail!("simulated ledger write failure")
            }
            let mut progress = self.progress.lock().unwrap();
            let entry = progress.entry((run_date, set_id.to_string())).or_default();
            if let Some(page) = page {
                entry.last_page_done = page;
            }
            if let Some(done) = done {
                entry.done = done;
            }
            Ok(())
        }

        async fn upsert_card_prices(&self, rows: &[CardPriceRow]) -> anyhow::Result<()> {
            if self.fail_upserts {
                anyhow::bail!("simulated write failure")
            }
            let mut prices = self.prices.lock().unwrap();
            for r in rows {
                prices.insert((r.card_id.clone(), r.variant.clone(), r.date), r.clone());
            }
            Ok(())
        }

        async fn price_count_for_date(&self, date: NaiveDate) -> anyhow::Result<i64> {
            Ok(self
                .prices
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.date == date)
                .count() as i64)
        }

        async fn progress_for_date(&self, date: NaiveDate) -> anyhow::Result<Vec<ProgressRow>> {
            Ok(self
                .progress
                .lock()
                .unwrap()
                .iter()
                .filter(|((d, _), _)| *d == date)
                .map(|((_, set_id), p)| ProgressRow {
                    set_id: set_id.clone(),
                    last_page_done: p.last_page_done,
                    done: p.done,
                })
                .collect())
        }
    }

    /// Per-set scripted upstream; exhausted queues answer with an empty page
    /// / found / matching search.
    #[derive(Default)]
    struct FakeApi {
        pages: Mutex<HashMap<String, VecDeque<PageReply>>>,
        lookups: Mutex<HashMap<String, VecDeque<LookupReply>>>,
        searches: Mutex<HashMap<String, VecDeque<SearchReply>>>,
        page_calls: Mutex<Vec<(String, u32)>>,
    }

    impl FakeApi {
        fn script_pages(&self, set_id: &str, replies: Vec<PageReply>) {
            self.pages
                .lock()
                .unwrap()
                .insert(set_id.to_string(), replies.into());
        }

        fn script_lookup(&self, set_id: &str, reply: LookupReply) {
            self.lookups
                .lock()
                .unwrap()
                .entry(set_id.to_string())
                .or_default()
                .push_back(reply);
        }

        fn script_search(&self, set_id: &str, reply: SearchReply) {
            self.searches
                .lock()
                .unwrap()
                .entry(set_id.to_string())
                .or_default()
                .push_back(reply);
        }

        fn page_calls(&self) -> Vec<(String, u32)> {
            self.page_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CardSource for FakeApi {
        async fn cards_page(
            &self,
            set_id: &str,
            page: u32,
            _page_size: u32,
        ) -> anyhow::Result<PageReply> {
            self.page_calls
                .lock()
                .unwrap()
                .push((set_id.to_string(), page));
            Ok(self
                .pages
                .lock()
                .unwrap()
                .get_mut(set_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(PageReply::Page(Vec::new())))
        }

        async fn set_by_id(&self, set_id: &str) -> anyhow::Result<LookupReply> {
            Ok(self
                .lookups
                .lock()
                .unwrap()
                .get_mut(set_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(LookupReply::Found))
        }

        async fn search_set(&self, set_id: &str) -> anyhow::Result<SearchReply> {
            Ok(self
                .searches
                .lock()
                .unwrap()
                .get_mut(set_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(SearchReply::Matches(true)))
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 27).unwrap()
    }

    fn priced_card(id: &str, market: f64) -> Card {
        serde_json::from_value(json!({
            "id": id,
            "tcgplayer": { "prices": { "normal": { "market": market, "low": market / 2.0 } } }
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn two_set_scenario_matches_expected_end_state() {
        let store = MemoryStore::with_sets(&["base1", "base2"]);
        let api = FakeApi::default();
        // base1: one page of cards, then the empty page that closes it out.
        api.script_pages(
            "base1",
            vec![
                PageReply::Page(vec![priced_card("base1-1", 4.0), priced_card("base1-2", 9.0)]),
                PageReply::Page(Vec::new()),
            ],
        );
        // base2: 404 confirmed absent by both signals.
        api.script_pages("base2", vec![PageReply::NotFound]);
        api.script_lookup("base2", LookupReply::Missing);
        api.script_search("base2", SearchReply::Matches(false));

        let cfg = RunConfig::default();
        let report = run_daily_update(&store, &api, &cfg, today()).await.unwrap();

        assert_eq!(report.sets_done, vec!["base1"]);
        assert_eq!(report.sets_skipped, vec!["base2"]);
        assert!(report.sets_deferred.is_empty());
        assert!(report.remaining.is_empty());
        assert_eq!(report.total_cards_seen, 2);
        assert_eq!(report.total_price_rows, 2);
        assert_eq!(report.db_rows_today, Some(2));

        assert_eq!(
            store.progress_of(today(), "base1").unwrap(),
            Progress { last_page_done: 1, done: true }
        );
        assert_eq!(
            store.progress_of(today(), "base2").unwrap(),
            Progress { last_page_done: 0, done: true }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sets_already_done_are_not_refetched() {
        let store = MemoryStore::with_sets(&["base1"]);
        store
            .patch_progress(today(), "base1", Some(3), Some(true))
            .await
            .unwrap();
        let api = FakeApi::default();

        let cfg = RunConfig::default();
        let report = run_daily_update(&store, &api, &cfg, today()).await.unwrap();

        assert!(api.page_calls().is_empty());
        assert!(report.sets_done.is_empty());
        assert_eq!(report.done_in_ledger, vec!["base1"]);
        assert!(report.remaining.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_continues_after_last_completed_page() {
        let store = MemoryStore::with_sets(&["base1"]);
        store
            .patch_progress(today(), "base1", Some(3), Some(false))
            .await
            .unwrap();
        let api = FakeApi::default();
        // Exhausted queue => empty page right away.

        let cfg = RunConfig::default();
        let report = run_daily_update(&store, &api, &cfg, today()).await.unwrap();

        assert_eq!(api.page_calls(), vec![("base1".to_string(), 4)]);
        assert_eq!(report.sets_done, vec!["base1"]);
        assert_eq!(
            store.progress_of(today(), "base1").unwrap(),
            Progress { last_page_done: 3, done: true }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deferral_leaves_the_ledger_untouched() {
        let store = MemoryStore::with_sets(&["base1"]);
        let api = FakeApi::default();
        api.script_pages(
            "base1",
            vec![
                PageReply::Page(vec![priced_card("base1-1", 2.0)]),
                PageReply::NotFound,
            ],
        );
        // Direct 404 but the search still finds the set: defer, don't skip.
        api.script_lookup("base1", LookupReply::Missing);
        api.script_search("base1", SearchReply::Matches(true));

        let cfg = RunConfig::default();
        let report = run_daily_update(&store, &api, &cfg, today()).await.unwrap();

        assert_eq!(report.sets_deferred, vec!["base1"]);
        assert_eq!(report.remaining, vec!["base1"]);
        assert_eq!(
            store.progress_of(today(), "base1").unwrap(),
            Progress { last_page_done: 1, done: false }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_upsert_keeps_latest_values() {
        let store = MemoryStore::with_sets(&[]);
        let first = CardPriceRow {
            card_id: "base1-1".into(),
            variant: "normal".into(),
            date: today(),
            market: Some(1.0),
            low: Some(0.5),
            high: None,
        };
        let second = CardPriceRow {
            market: Some(2.5),
            ..first.clone()
        };
        store.upsert_card_prices(&[first]).await.unwrap();
        store.upsert_card_prices(&[second.clone()]).await.unwrap();

        assert_eq!(store.price_count_for_date(today()).await.unwrap(), 1);
        let stored = store
            .prices
            .lock()
            .unwrap()
            .get(&("base1-1".into(), "normal".into(), today()))
            .cloned()
            .unwrap();
        assert_eq!(stored, second);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_sink_failure_does_not_abort_the_run() {
        let store = MemoryStore {
            fail_upserts: true,
            ..MemoryStore::with_sets(&["base1"])
        };
        let api = FakeApi::default();
        api.script_pages(
            "base1",
            vec![
                PageReply::Page(vec![priced_card("base1-1", 3.0)]),
                PageReply::Page(Vec::new()),
            ],
        );

        let cfg = RunConfig::default();
        let report = run_daily_update(&store, &api, &cfg, today()).await.unwrap();

        // The batch was dropped but paging still completed.
        assert_eq!(report.sets_done, vec!["base1"]);
        assert_eq!(report.db_rows_today, Some(0));
        assert_eq!(
            store.progress_of(today(), "base1").unwrap(),
            Progress { last_page_done: 1, done: true }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_write_failure_defers_one_set_without_stopping_the_run() {
        let store = MemoryStore {
            fail_patches_for: Some("base1".into()),
            ..MemoryStore::with_sets(&["base1", "base2"])
        };
        let api = FakeApi::default();
        api.script_pages(
            "base1",
            vec![
                PageReply::Page(vec![priced_card("base1-1", 3.0)]),
                PageReply::Page(Vec::new()),
            ],
        );
        api.script_pages(
            "base2",
            vec![
                PageReply::Page(vec![priced_card("base2-1", 7.0)]),
                PageReply::Page(Vec::new()),
            ],
        );

        let cfg = RunConfig::default();
        let report = run_daily_update(&store, &api, &cfg, today()).await.unwrap();

        // base1's ledger write blew up mid-page; the set is deferred and the
        // loop moves on to base2.
        assert_eq!(report.sets_deferred, vec!["base1"]);
        assert_eq!(report.sets_done, vec!["base2"]);
        assert_eq!(report.remaining, vec!["base1"]);
        assert_eq!(
            store.progress_of(today(), "base2").unwrap(),
            Progress { last_page_done: 1, done: true }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn render_lists_every_outcome_bucket() {
        let store = MemoryStore::with_sets(&["base1", "base2", "base3"]);
        let api = FakeApi::default();
        api.script_pages("base2", vec![PageReply::NotFound]);
        api.script_lookup("base2", LookupReply::Missing);
        api.script_search("base2", SearchReply::Matches(false));
        api.script_pages("base3", vec![PageReply::Unexpected(418)]);

        let cfg = RunConfig::default();
        let report = run_daily_update(&store, &api, &cfg, today()).await.unwrap();
        let rendered = report.render();

        assert!(rendered.contains("sets done today: 1"));
        assert!(rendered.contains("sets skipped (absent upstream): 1"));
        assert!(rendered.contains("sets deferred to next run: 1"));
        assert!(rendered.contains("sets remaining: 1"));
        assert!(rendered.contains("base3"));
    }
}
