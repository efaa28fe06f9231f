/// Close the day's voting round and record its result.
/// Run daily after lunch voting ends (e.g., via cron job: 30 11 * * 1-5 /app/close-voting)
///
/// Usage: close-voting [--date YYYY-MM-DD]
///   --date  : Date to close (optional, today in UTC if not specified)

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::Parser;

use food_vote_api::{
    config::Config,
    db::{self, daily_menu::PgDailyMenuStore, foods::PgFoodCatalog},
    error::VoteError,
    routes::retry_on_conflict,
    services::daily_menu::DailyMenuService,
};

#[derive(Parser)]
#[command(name = "close-voting", about = "Close the daily menu vote for a date")]
struct Args {
    /// Date to close (defaults to today, UTC)
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());

    let pool = db::create_pool(config.require_database_url()?, 5).await?;
    let service = DailyMenuService::new(
        Arc::new(PgDailyMenuStore::new(pool.clone())),
        Arc::new(PgFoodCatalog::new(pool)),
    );

    tracing::info!("Closing voting for {}", date);

    match retry_on_conflict(config.vote_retry_limit, || service.close_voting(date)).await {
        Ok(state) => {
            tracing::info!(
                "Closed voting for {}: winning food {:?}, {} vote(s)",
                date,
                state.winning_food_id,
                state.total_votes()
            );
        }
        // Nothing to close is not a failure for a scheduled job
        Err(VoteError::NotFound(msg)) | Err(VoteError::Validation(msg)) => {
            tracing::warn!("Nothing closed for {}: {}", date, msg);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
