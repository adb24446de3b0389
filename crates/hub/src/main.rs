mod clock;
mod config;
mod db;
mod engine;
mod error;
mod evaluator;
mod executor;
mod model;
mod notify;
mod registry;
mod scheduler;
mod simulator;
mod state;
mod tasks;
mod valve;
mod weather;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use db::Db;
use engine::Engine;
use notify::{LogNotifier, MqttNotifier, Notifier};
use state::EventKind;
use valve::ValveBoard;
use weather::WeatherClient;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Config file (settings, location, seed zones) ─────────────────
    let cfg = config::load_or_default(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let store = match open_store(&db_url).await {
        Ok(db) => {
            info!(%db_url, "persistence ready");
            Some(db)
        }
        Err(e) => {
            warn!("persistence unavailable, running in memory: {e:#}");
            None
        }
    };

    // ── Valve board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set
    // relay_active_low = false under [engine].
    let mut valves = ValveBoard::new(cfg.engine.relay_active_low)?;
    valves.all_off();

    // ── Notifications ───────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match &cfg.mqtt {
        Some(mqtt) => {
            info!(broker = %mqtt.host, topic = %mqtt.topic, "notifications via mqtt");
            Arc::new(MqttNotifier::connect(mqtt))
        }
        None => Arc::new(LogNotifier),
    };

    // ── Engine ──────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut engine = Engine::new(
        cfg.settings.clone().unwrap_or_default(),
        Arc::clone(&clock),
        notifier,
    )
    .with_valves(valves);
    if let Some(seed) = cfg.engine.rng_seed {
        engine = engine.with_rng_seed(seed);
    }
    if let Some(db) = store {
        engine = engine.with_store(db);
    }
    let engine = Arc::new(engine);

    // Stored state first, then seed zones refresh their static attributes.
    engine.restore().await;
    config::apply(&cfg, &engine).await?;
    engine.record(EventKind::System, "hub started").await;

    // ── Weather ─────────────────────────────────────────────────────
    let weather = match &cfg.location {
        Some(loc) => {
            match WeatherClient::new(loc.latitude, loc.longitude, cfg.engine.weather_timeout()) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("weather disabled: {e}");
                    None
                }
            }
        }
        None => None,
    };

    // ── Background loops ────────────────────────────────────────────
    let _tasks = tasks::spawn_all(Arc::clone(&engine), &cfg.engine, weather, clock).await;

    // ── Web server ──────────────────────────────────────────────────
    let state = AppState {
        engine: Arc::clone(&engine),
        active_delay: cfg.engine.active_delay(),
    };
    let result = tokio::select! {
        res = web::serve(state, web_port) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    };

    // Fail-safe: never leave a valve open on exit.
    engine.shutdown().await;
    result
}

async fn open_store(db_url: &str) -> Result<Db> {
    let db = Db::connect(db_url).await?;
    db.migrate().await?;
    Ok(db)
}
