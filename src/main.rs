use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use food_vote_api::{
    config::Config,
    db::{self, daily_menu::PgDailyMenuStore, foods::PgFoodCatalog},
    routes,
    services::daily_menu::DailyMenuService,
    store::{
        memory::{MemoryDailyMenuStore, MemoryFoodCatalog},
        DailyMenuStore, FoodCatalog,
    },
    AppState,
};

#[derive(Parser)]
#[command(name = "api", about = "Food-of-the-day voting API")]
struct Args {
    /// Keep everything in memory with a small demo food catalog (no database)
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::from_env()?);

    let (store, catalog): (Arc<dyn DailyMenuStore>, Arc<dyn FoodCatalog>) = if args.in_memory {
        info!("Running with in-memory storage; data is lost on exit");
        (
            Arc::new(MemoryDailyMenuStore::new()),
            Arc::new(MemoryFoodCatalog::demo()),
        )
    } else {
        let pool =
            db::create_pool(config.require_database_url()?, config.database_max_connections)
                .await?;
        db::run_migrations(&pool).await?;
        info!("Database connected and migrations applied");
        (
            Arc::new(PgDailyMenuStore::new(pool.clone())),
            Arc::new(PgFoodCatalog::new(pool)),
        )
    };

    let state = AppState {
        config: config.clone(),
        menus: Arc::new(DailyMenuService::new(store, catalog)),
    };

    let app = routes::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Food vote API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
