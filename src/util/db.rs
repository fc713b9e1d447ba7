use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, QueryBuilder, Row,
};
use tracing::{info, instrument};

use crate::model::{CardPriceRow, Progress};
use crate::store::{ProgressRow, Store};
use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // sqlx picks TLS up from the DSN, but be explicit when asked for.
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // PgBouncer transaction mode chokes on prepared statements.
        if !env_flag("USE_PREPARED", false) {
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");

        // Opt-in auto-migrate; default off so the binary can run against a
        // schema managed elsewhere (e.g., Supabase migrations).
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            Self::run_migrations(&pool).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    // Lightweight migration runner: numeric-prefixed .sql files under
    // ./migrations, tracked in _sqlx_migrations, executed via raw_sql so no
    // prepared statements hit a pooler.
    async fn run_migrations(pool: &PgPool) -> Result<()> {
        use std::{collections::HashSet, fs, path::Path};
        let dir = Path::new("./migrations");
        if !dir.exists() {
            return Ok(());
        }
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;

        let mut applied: HashSet<i64> = HashSet::new();
        for row in sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
            .fetch_all(pool)
            .await?
        {
            applied.insert(row.try_get::<i64, _>(0)?);
        }

        let mut candidates: Vec<(i64, String, std::path::PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if !path.is_file() || !name.ends_with(".sql") {
                continue;
            }
            let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
            let Ok(version) = digits.parse::<i64>() else {
                continue;
            };
            let desc = name
                .trim_start_matches(digits.as_str())
                .trim_start_matches('_')
                .trim_end_matches(".sql")
                .to_string();
            candidates.push((version, desc, path));
        }
        candidates.sort_by_key(|(v, _, _)| *v);

        for (version, desc, path) in candidates {
            if applied.contains(&version) {
                continue;
            }
            let sql = fs::read_to_string(&path)?;
            info!(version, file = ?path, "applying migration");
            sqlx::raw_sql(&sql).execute(pool).await?;
            let desc_escaped = desc.replace('\'', "''");
            let insert_stmt = format!(
                "INSERT INTO _sqlx_migrations(version, description) VALUES ({}, '{}')",
                version, desc_escaped
            );
            sqlx::raw_sql(&insert_stmt).execute(pool).await?;
            applied.insert(version);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for Db {
    async fn set_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM sets ORDER BY id")
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn read_or_init_progress(&self, run_date: NaiveDate, set_id: &str) -> Result<Progress> {
        let row: Option<(i32, bool)> = sqlx::query_as(
            "SELECT last_page_done, done FROM price_run_progress
             WHERE run_date = $1 AND set_id = $2",
        )
        .persistent(false)
        .bind(run_date)
        .bind(set_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((last_page_done, done)) = row {
            return Ok(Progress {
                last_page_done,
                done,
            });
        }

        sqlx::query(
            "INSERT INTO price_run_progress (run_date, set_id, last_page_done, done)
             VALUES ($1, $2, 0, FALSE)
             ON CONFLICT (run_date, set_id) DO NOTHING",
        )
        .persistent(false)
        .bind(run_date)
        .bind(set_id)
        .execute(&self.pool)
        .await?;
        Ok(Progress::default())
    }

    async fn patch_progress(
        &self,
        run_date: NaiveDate,
        set_id: &str,
        page: Option<i32>,
        done: Option<bool>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO price_run_progress (run_date, set_id, last_page_done, done)
             VALUES ($1, $2, COALESCE($3, 0), COALESCE($4, FALSE))
             ON CONFLICT (run_date, set_id) DO UPDATE
             SET last_page_done = COALESCE($3, price_run_progress.last_page_done),
                 done = COALESCE($4, price_run_progress.done)",
        )
        .persistent(false)
        .bind(run_date)
        .bind(set_id)
        .bind(page)
        .bind(done)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, rows))]
    async fn upsert_card_prices(&self, rows: &[CardPriceRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO card_prices (card_id, variant, date, market, low, high) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(&r.card_id)
                .push_bind(&r.variant)
                .push_bind(r.date)
                .push_bind(r.market)
                .push_bind(r.low)
                .push_bind(r.high);
        });
        qb.push(
            " ON CONFLICT (card_id, variant, date)
              DO UPDATE SET market = EXCLUDED.market,
                            low = EXCLUDED.low,
                            high = EXCLUDED.high",
        );
        qb.build().persistent(false).execute(&self.pool).await?;
        Ok(())
    }

    async fn price_count_for_date(&self, date: NaiveDate) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM card_prices WHERE date = $1")
            .persistent(false)
            .bind(date)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn progress_for_date(&self, date: NaiveDate) -> Result<Vec<ProgressRow>> {
        let rows: Vec<(String, i32, bool)> = sqlx::query_as(
            "SELECT set_id, last_page_done, done FROM price_run_progress WHERE run_date = $1",
        )
        .persistent(false)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(set_id, last_page_done, done)| ProgressRow {
                set_id,
                last_page_done,
                done,
            })
            .collect())
    }
}
