//! Periodic background loops driving the engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::weather::WeatherClient;

/// Spawn the simulator, scheduler, executor and (when a client is given)
/// weather loops. Runs left active by a previous process are finished after
/// the usual delay.
pub async fn spawn_all(
    engine: Arc<Engine>,
    cfg: &EngineConfig,
    weather: Option<WeatherClient>,
    clock: Arc<dyn Clock>,
) -> Vec<JoinHandle<()>> {
    let active_delay = cfg.active_delay();

    for id in engine.active_schedule_ids().await {
        info!(schedule = %id, "resuming interrupted irrigation run");
        finish_after(Arc::clone(&engine), id, active_delay);
    }

    let mut handles = vec![
        spawn_simulator(Arc::clone(&engine), secs(cfg.simulator_interval_secs)),
        spawn_scheduler(Arc::clone(&engine), secs(cfg.scheduler_interval_secs)),
        spawn_executor(
            Arc::clone(&engine),
            secs(cfg.executor_interval_secs),
            active_delay,
        ),
    ];
    match weather {
        Some(client) => handles.push(spawn_weather(
            Arc::clone(&engine),
            client,
            secs(cfg.weather_interval_secs),
            clock,
        )),
        None => info!("no [location] configured, weather refresh disabled"),
    }
    handles
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

// ── Moisture simulator ─────────────────────────────────────────────

fn spawn_simulator(engine: Arc<Engine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let updated = engine.simulate_tick().await;
            debug!(updated, "simulator tick");
        }
    })
}

// ── Auto-scheduler ──────────────────────────────────────────────────

fn spawn_scheduler(engine: Arc<Engine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let created = engine.run_auto_schedule_tick().await;
            if !created.is_empty() {
                info!(created = created.len(), "scheduler pass");
            }
        }
    })
}

// ── Executor ────────────────────────────────────────────────────────

fn spawn_executor(engine: Arc<Engine>, every: Duration, active_delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for entry in engine.start_due().await {
                finish_after(Arc::clone(&engine), entry.id, active_delay);
            }
        }
    })
}

/// Complete an active run once `delay` has passed.
pub fn finish_after(engine: Arc<Engine>, schedule_id: String, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        if let Err(e) = engine.complete_schedule(&schedule_id).await {
            warn!(schedule = %schedule_id, "could not finish run: {e}");
        }
    })
}

// ── Weather refresh ─────────────────────────────────────────────────

fn spawn_weather(
    engine: Arc<Engine>,
    client: WeatherClient,
    every: Duration,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !engine.settings().await.weather_integration {
                debug!("weather integration off, skipping refresh");
                engine.clear_weather().await;
                continue;
            }
            let snapshot = client.snapshot(clock.now()).await;
            if snapshot.is_none() {
                warn!("weather: no data this cycle");
            }
            engine.set_weather(snapshot).await;
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::model::{IrrigationMethod, Priority, ScheduleStatus, Settings, SoilType, ZoneSpec};
    use crate::notify::LogNotifier;

    fn zone(id: &str) -> ZoneSpec {
        ZoneSpec {
            id: Some(id.into()),
            name: id.into(),
            crop_type: "rice".into(),
            area_acres: 1.0,
            soil_type: SoilType::Clay,
            irrigation_method: IrrigationMethod::Flood,
            flow_rate_lpm: 20.0,
            default_duration_min: 15,
            priority: Priority::High,
            target_moisture: 60.0,
            current_moisture: Some(50.0),
            active: Some(true),
            valve_pin: None,
        }
    }

    #[tokio::test]
    async fn finish_after_completes_active_run() {
        let engine = Arc::new(Engine::new(
            Settings::default(),
            Arc::new(SystemClock),
            Arc::new(LogNotifier),
        ));
        engine.upsert_zone(zone("z1")).await.unwrap();
        let entry = engine.trigger_manual_water("z1").await.unwrap();

        finish_after(Arc::clone(&engine), entry.id.clone(), Duration::from_millis(10))
            .await
            .unwrap();

        let done = engine.list_schedules().await;
        assert_eq!(done[0].status, ScheduleStatus::Completed);
    }

    #[tokio::test]
    async fn finish_after_tolerates_unknown_id() {
        let engine = Arc::new(Engine::new(
            Settings::default(),
            Arc::new(SystemClock),
            Arc::new(LogNotifier),
        ));
        finish_after(engine, "missing".into(), Duration::from_millis(1))
            .await
            .unwrap();
    }
}
