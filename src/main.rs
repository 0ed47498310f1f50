use std::sync::Arc;

use anyhow::{Context, Result};
use gstreamer as gst;
use log::info;

use shopguard::ai::ModelManager;
use shopguard::api::{build_router, AppState};
use shopguard::config::Config;
use shopguard::db::repositories::ShopsRepository;
use shopguard::db::DatabaseService;
use shopguard::lifecycle::Lifecycle;
use shopguard::messaging::{AlertHub, AlertSink, TelegramService};
use shopguard::recorder::AnomalyRecorder;
use shopguard::security::AuthService;
use shopguard::streams::StreamRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("starting shopguard");

    gst::init().context("gstreamer init")?;

    let config = Arc::new(Config::from_env());
    info!(
        "configuration loaded (environment: {})",
        config.server.environment
    );

    let db = DatabaseService::new(&config.database).await?;

    let models = Arc::new(ModelManager::new(
        config.models.clone(),
        config.detection.clone(),
    ));

    let telegram = match &config.telegram.bot_token {
        Some(token) => Some(Arc::new(TelegramService::new(token)?)),
        None => None,
    };

    let hub = AlertHub::new(
        telegram
            .clone()
            .map(|service| service as Arc<dyn AlertSink>),
    );
    let registry = Arc::new(StreamRegistry::new());
    let recorder = Arc::new(AnomalyRecorder::new(
        Arc::clone(&db.pool),
        config.storage.anomaly_frames_dir.clone(),
    ));
    let auth = Arc::new(AuthService::new(&config.security.jwt_secret));
    let shops = ShopsRepository::new(Arc::clone(&db.pool));

    let lifecycle = Arc::new(Lifecycle::new(
        Arc::clone(&models),
        Arc::clone(&hub),
        Arc::clone(&registry),
        telegram,
    ));
    lifecycle.startup().context("startup")?;

    let state = AppState {
        config: Arc::clone(&config),
        auth,
        shops,
        models,
        registry,
        hub,
        recorder,
        db: Arc::clone(&db.pool),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await
        .context("server")?;

    lifecycle.shutdown().await;
    Ok(())
}
