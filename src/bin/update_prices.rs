use anyhow::Result;
use chrono::Utc;

use tcg_price_tracker::config::RunConfig;
use tcg_price_tracker::logging::init_tracing;
use tcg_price_tracker::orchestrator::run_daily_update;
use tcg_price_tracker::source::TcgClient;
use tcg_price_tracker::util::db::Db;
use tcg_price_tracker::util::env::{
    db_url_prefer_session, env_opt, env_parse, env_req, init_env, preflight_check,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    init_env();

    preflight_check(
        "update-prices",
        &["POKEMON_TCG_API_KEY"],
        &[
            "SUPABASE_DB_SESSION_URL",
            "SUPABASE_DB_URL",
            "DATABASE_URL",
            "PAGE_SIZES",
            "BETWEEN_PAGES_DELAY",
            "POST_BATCH_DELAY",
            "MAX_RETRIES",
            "REQ_TIMEOUT",
        ],
    )?;

    let cfg = RunConfig::from_env();
    let api_key = env_req("POKEMON_TCG_API_KEY")?;
    let client = TcgClient::new(env_opt("TCG_API_BASE").as_deref(), cfg.request_timeout)?
        .with_api_key(Some(api_key));

    let url = db_url_prefer_session()?;
    let db = Db::connect(&url, env_parse("DB_MAX_CONNS", 5)).await?;

    // One calendar date for the whole invocation; repeated runs on the same
    // day coalesce through the ledger's (run_date, set_id) key.
    let run_date = Utc::now().date_naive();
    let report = run_daily_update(&db, &client, &cfg, run_date).await?;
    println!("{}", report.render());
    Ok(())
}
