use axum::{routing::{get, post}, Router};
use proposal_settlement::api;
use proposal_settlement::db::{create_pool, run_migrations, PgStore};
use proposal_settlement::service::{
    HttpBillingPlatform, PgJobStageTracker, RateTableTaxResolver, SettlementService,
};
use proposal_settlement::service::tax::RateTable;
use proposal_settlement::AppConfig;
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 本地时间格式, 级别由 RUST_LOG 控制 (默认 info)
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::from_env();
    info!("Starting server with config: {:?}", config);

    // 创建数据库连接池并建表
    let pool = create_pool(
        &config.database.url,
        config.settlement.capability_timeout(),
    )
    .await?;
    run_migrations(&pool).await?;
    info!("Database pool created, migrations applied");

    let tax = match &config.tax.rates_file {
        Some(path) => RateTableTaxResolver::from_file(path, config.tax.default_state_rate.clone())?,
        None => {
            info!("TAX_RATES_FILE not set, using default state rate only");
            RateTableTaxResolver::new(RateTable::default(), config.tax.default_state_rate.clone())
        }
    };

    let service = Arc::new(SettlementService::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(HttpBillingPlatform::new(&config.billing)?),
        Arc::new(tax),
        Arc::new(PgJobStageTracker::new(pool)),
        config.settlement.clone(),
    ));

    // 构建路由
    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/api/proposals/:id/settle", post(api::settle_proposal))
        .route(
            "/api/proposals/:id/stages/:stage/invoice",
            post(api::invoice_stage),
        )
        .with_state(service)
        .layer(ServiceBuilder::new());

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/proposals/:id/settle                - deposit invoice + job");
    info!("  POST /api/proposals/:id/stages/:stage/invoice - rough_in / final invoice");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
