use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use hvac_common::{
    pins::sim::RelayBoard, sensor_id_from_topic, Controller, DecisionRecord, FaultKind,
    HvacConfig, RuntimeConfig, SensorCache, TOPIC_CONTROLLER_CLEAR_FAULT,
    TOPIC_CONTROLLER_DECISION, TOPIC_CONTROLLER_FAULT, TOPIC_CONTROLLER_STATUS, TOPIC_PRESENCE,
    TOPIC_SENSOR_TEMP_FILTER,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const STATUS_PUBLISH_INTERVAL: Duration = Duration::from_secs(60);

/// Controller plus the pins it drives, locked together so one cycle owns both.
struct Plant {
    controller: Controller,
    board: RelayBoard,
}

#[derive(Clone)]
struct AppState {
    plant: Arc<Mutex<Plant>>,
    sensors: SensorCache,
    timezone: Tz,
    mqtt: AsyncClient,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let runtime = store.load().await?;
    let config = Arc::new(
        HvacConfig::from_runtime(runtime)
            .with_context(|| format!("invalid configuration in {}", store.path.display()))?,
    );
    let timezone: Tz = match config.timezone().parse() {
        Ok(tz) => tz,
        Err(_) => bail!("unknown timezone `{}`", config.timezone()),
    };

    info!(
        "controlling group {} ({} sensors), polling every {} ms",
        config.control_group().name(),
        config.control_group().members().len(),
        config.tuning().poll_interval_ms
    );

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("hvac-controller-rust", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let board = RelayBoard::new(*config.pins());
    let app_state = AppState {
        plant: Arc::new(Mutex::new(Plant {
            controller: Controller::new(Arc::clone(&config)),
            board,
        })),
        sensors: SensorCache::with_known(config.sensors().map(|(name, _)| name)),
        timezone,
        mqtt,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_status_publish_loop(app_state.clone());
    let poll_interval = Duration::from_millis(config.tuning().poll_interval_ms);

    tokio::select! {
        result = control_loop(app_state, poll_interval) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
            Ok(())
        }
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [
        TOPIC_SENSOR_TEMP_FILTER,
        TOPIC_PRESENCE,
        TOPIC_CONTROLLER_CLEAR_FAULT,
    ] {
        mqtt.subscribe(topic, QoS::AtMostOnce)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;

    if let Some(sensor_id) = sensor_id_from_topic(&topic) {
        if app_state
            .sensors
            .record_payload(sensor_id, &message, monotonic_ms())
        {
            debug!("reading from {sensor_id}: {}", message.trim());
        } else {
            debug!("ignoring reading from unconfigured sensor {sensor_id}");
        }
        return Ok(());
    }

    if topic == TOPIC_CONTROLLER_CLEAR_FAULT {
        let mut plant = app_state.plant.lock().await;
        if plant.controller.is_faulted() {
            plant.controller.clear_fault();
            info!("actuation fault cleared, relays re-verified on next cycle");
        } else {
            debug!("clear_fault received with no fault latched");
        }
        return Ok(());
    }

    if topic == TOPIC_PRESENCE {
        let mut plant = app_state.plant.lock().await;
        let previous = plant.controller.active_override().map(str::to_string);
        plant.controller.set_active_override(Some(&message));
        let current = plant.controller.active_override();
        if previous.as_deref() != current {
            info!(
                "presence override changed: {} -> {}",
                previous.as_deref().unwrap_or("none"),
                current.unwrap_or("none")
            );
        }
    }

    Ok(())
}

async fn control_loop(app_state: AppState, poll_interval: Duration) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now_ms = monotonic_ms();
        let local = now_in_timezone(app_state.timezone);

        let plant = Arc::clone(&app_state.plant);
        let sensors = app_state.sensors.clone();
        let record = tokio::task::spawn_blocking(move || {
            let mut plant = plant.blocking_lock();
            let Plant { controller, board } = &mut *plant;
            controller.run_cycle(&sensors, board, now_ms, local)
        })
        .await
        .context("decision cycle panicked")?;

        log_record(&record);
        publish_record(&app_state.mqtt, &record).await;
    }
}

fn log_record(record: &DecisionRecord) {
    let season = record.season.map_or("none", |season| season.as_str());
    let target = record
        .target
        .as_ref()
        .map_or_else(|| "none".to_string(), |target| format!("{:.1}F", target.target_f));
    let temp = record
        .aggregated_temp_f
        .map_or_else(|| "none".to_string(), |temp| format!("{temp:.1}F"));

    if let Some(fault) = record.fault {
        let detail = record.fault_detail.as_deref().unwrap_or("");
        match fault {
            FaultKind::ScheduleGap => error!("schedule gap, holding OFF: {detail}"),
            FaultKind::NoSensorData => warn!("no usable sensor data, forcing OFF: {detail}"),
            FaultKind::ActuationFault => {
                error!("actuation fault, outputs released and latched OFF: {detail}")
            }
        }
        return;
    }

    if record.degraded {
        let excluded = record
            .excluded
            .iter()
            .map(|exclusion| format!("{exclusion:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        warn!("degraded reading from {} sensors; excluded: {excluded}", record.used_sensors.len());
    }

    if record.transitioned() {
        info!(
            "{} -> {} (season {season}, target {target}, temp {temp})",
            record.previous_state, record.new_state
        );
    } else if record.fault_latched {
        warn!("fault latched, holding OFF (temp {temp}, target {target})");
    } else {
        debug!(
            "holding {} (season {season}, target {target}, temp {temp})",
            record.new_state
        );
    }
}

async fn publish_record(mqtt: &AsyncClient, record: &DecisionRecord) {
    let body = match serde_json::to_vec(record) {
        Ok(body) => body,
        Err(err) => {
            warn!("decision record serialization failed: {err}");
            return;
        }
    };

    if record.fault.is_some() {
        if let Err(err) = mqtt
            .publish(TOPIC_CONTROLLER_FAULT, QoS::AtLeastOnce, false, body.clone())
            .await
        {
            warn!("fault publish failed: {err}");
        }
    }

    if let Err(err) = mqtt
        .publish(TOPIC_CONTROLLER_DECISION, QoS::AtMostOnce, false, body)
        .await
    {
        warn!("decision publish failed: {err}");
    }
}

fn spawn_status_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_PUBLISH_INTERVAL);
        loop {
            interval.tick().await;

            let now_ms = monotonic_ms();
            let payload = {
                let plant = app_state.plant.lock().await;
                serde_json::to_vec(&plant.controller.status(now_ms))
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATUS, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller status publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller status serialization failed: {err}"),
            }
        }
    });
}

struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    fn new() -> Self {
        let path = std::env::var("HVAC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.hvac/config.json"));
        Self { path }
    }

    async fn load(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => RuntimeConfig::from_json(&raw)
                .with_context(|| format!("failed to parse {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(
                    "no configuration at {}, using built-in household defaults",
                    self.path.display()
                );
                Ok(RuntimeConfig::default())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }
}

fn now_in_timezone(tz: Tz) -> chrono::DateTime<chrono::FixedOffset> {
    let local = Utc::now().with_timezone(&tz);
    local.with_timezone(&local.offset().fix())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
