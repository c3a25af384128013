use std::{io::ErrorKind, path::PathBuf, time::Duration};

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{debug, info, warn};

use hvac_common::{sensor_temperature_topic, HvacConfig, RuntimeConfig, TOPIC_SENSOR_STATUS};

const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

/// One simulated probe per configured sensor.
struct SimulatedSensor {
    id: String,
    offset_f: f32,
    failing: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config().await?;
    let base_f = std::env::var("SIM_BASE_F")
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(68.0);
    let failing = std::env::var("SIM_FAIL")
        .map(|value| parse_failing(&value))
        .unwrap_or_default();

    let sensors: Vec<SimulatedSensor> = config
        .sensors()
        .map(|(id, spec)| SimulatedSensor {
            id: id.to_string(),
            offset_f: f32::from(spec.channel) * 0.4 - 0.4,
            failing: is_failing(&failing, id),
        })
        .collect();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("hvac-sensor-rust", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    mqtt.publish(TOPIC_SENSOR_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish sensor online status")?;

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!(
        "sensor publisher started for {} sensors around {base_f:.1}F",
        sensors.len()
    );

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(PUBLISH_INTERVAL);

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);
        let drift_f = (tick % 8) as f32 * 0.2;

        for sensor in &sensors {
            let payload = if sensor.failing {
                "nan".to_string()
            } else {
                format!("{:.1}", base_f + sensor.offset_f + drift_f)
            };
            debug!("{} -> {payload}", sensor.id);

            mqtt.publish(
                sensor_temperature_topic(&sensor.id),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .with_context(|| format!("failed to publish temperature for {}", sensor.id))?;
        }
    }
}

async fn load_config() -> anyhow::Result<HvacConfig> {
    let path = std::env::var("HVAC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.hvac/config.json"));

    let runtime = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => RuntimeConfig::from_json(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("no configuration at {}, simulating household sensors", path.display());
            RuntimeConfig::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    HvacConfig::from_runtime(runtime)
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

fn parse_failing(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_failing(failing: &[String], sensor_id: &str) -> bool {
    failing
        .iter()
        .any(|failed| failed.eq_ignore_ascii_case(sensor_id))
}
