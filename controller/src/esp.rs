use core::convert::TryInto;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};

use hvac_common::{
    sensor_id_from_topic, Controller, DecisionRecord, HvacConfig, HvacPinSet, HvacPins, HvacStatus,
    PinError, PinId, PinLevel, RuntimeConfig, SensorCache, TOPIC_CONTROLLER_DECISION,
    TOPIC_CONTROLLER_CLEAR_FAULT, TOPIC_CONTROLLER_FAULT, TOPIC_CONTROLLER_STATUS, TOPIC_PRESENCE,
    TOPIC_SENSOR_TEMP_FILTER,
};

const NVS_NAMESPACE: &str = "hvac";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_CONFIG_MAX_BYTES: usize = 8192;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const STATUS_PUBLISH_INTERVAL_MS: u64 = 60_000;

const WIFI_SSID: Option<&str> = option_env!("WIFI_SSID");
const WIFI_PASS: Option<&str> = option_env!("WIFI_PASS");
const MQTT_HOST: Option<&str> = option_env!("MQTT_HOST");
const MQTT_PORT: Option<&str> = option_env!("MQTT_PORT");
const MQTT_USER: Option<&str> = option_env!("MQTT_USER");
const MQTT_PASS: Option<&str> = option_env!("MQTT_PASS");

/// GPIO-backed latching relay driver. Logical pin numbers from `controlPins`
/// are used directly as GPIO numbers.
struct GpioPins {
    outputs: HashMap<PinId, PinDriver<'static, AnyOutputPin, Output>>,
    inputs: HashMap<PinId, PinDriver<'static, AnyIOPin, Input>>,
}

impl GpioPins {
    fn new(pin_set: &HvacPinSet) -> anyhow::Result<Self> {
        let mut outputs = HashMap::new();
        for pin in pin_set.outputs() {
            let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(pin))) }
                .with_context(|| format!("failed to claim GPIO{pin} as output"))?;
            driver.set_low()?;
            outputs.insert(pin, driver);
        }

        let mut inputs = HashMap::new();
        for pin in pin_set.inputs() {
            let mut driver = unsafe { PinDriver::input(AnyIOPin::new(i32::from(pin))) }
                .with_context(|| format!("failed to claim GPIO{pin} as input"))?;
            driver.set_pull(Pull::Down)?;
            inputs.insert(pin, driver);
        }

        Ok(Self { outputs, inputs })
    }
}

impl HvacPins for GpioPins {
    fn write(&mut self, pin: PinId, level: PinLevel) -> Result<(), PinError> {
        let driver = self.outputs.get_mut(&pin).ok_or_else(|| PinError::Io {
            pin,
            reason: "not configured as output".to_string(),
        })?;
        let result = if level.is_high() {
            driver.set_high()
        } else {
            driver.set_low()
        };
        result.map_err(|err| PinError::Io {
            pin,
            reason: err.to_string(),
        })
    }

    fn read(&mut self, pin: PinId) -> Result<PinLevel, PinError> {
        let driver = self.inputs.get(&pin).ok_or_else(|| PinError::Io {
            pin,
            reason: "not configured as input".to_string(),
        })?;
        Ok(PinLevel::from_bool(driver.is_high()))
    }
}

struct Plant {
    controller: Controller,
    pins: GpioPins,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<Option<RuntimeConfig>> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_CONFIG_MAX_BYTES];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(Some(RuntimeConfig::from_json(value)?)),
            None => Ok(None),
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let runtime = match nvs_store.load_config()? {
        Some(runtime) => runtime,
        None => {
            warn!("no configuration in NVS, using built-in household defaults");
            RuntimeConfig::default()
        }
    };
    let config = Arc::new(HvacConfig::from_runtime(runtime).context("invalid configuration")?);
    let timezone: Tz = config
        .timezone()
        .parse()
        .map_err(|_| anyhow!("unknown timezone `{}`", config.timezone()))?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let pins = GpioPins::new(config.pins())?;
    info!("relay pins claimed: {:?}", config.pins());

    let wifi = connect_wifi(modem, sys_loop, nvs_partition).context("wifi startup failed")?;
    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let sensors = SensorCache::with_known(config.sensors().map(|(name, _)| name));
    let plant = Arc::new(Mutex::new(Plant {
        controller: Controller::new(Arc::clone(&config)),
        pins,
    }));

    let (mqtt_client, mqtt_conn) = create_mqtt_client()?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    subscribe_topics(&mqtt_client)?;
    spawn_mqtt_receiver(plant.clone(), sensors.clone(), mqtt_conn, mqtt_client.clone())?;
    spawn_control_loop(plant, sensors, timezone, config, mqtt_client)?;

    let _wifi = wifi;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    let ssid = WIFI_SSID.ok_or_else(|| anyhow!("WIFI_SSID was not set at build time"))?;
    let pass = WIFI_PASS.unwrap_or_default();

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        ));
    }
    Ok(esp_wifi)
}

fn create_mqtt_client() -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let host = MQTT_HOST.unwrap_or("127.0.0.1");
    let port = MQTT_PORT
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let url = format!("mqtt://{host}:{port}");

    let conf = MqttClientConfiguration {
        client_id: Some("hvac-controller"),
        username: MQTT_USER.filter(|user| !user.is_empty()),
        password: MQTT_PASS.filter(|pass| !pass.is_empty()),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    for topic in [
        TOPIC_SENSOR_TEMP_FILTER,
        TOPIC_PRESENCE,
        TOPIC_CONTROLLER_CLEAR_FAULT,
    ] {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    plant: Arc<Mutex<Plant>>,
    sensors: SensorCache,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    else {
                        continue;
                    };

                    if !matches!(details, Details::Complete) {
                        continue;
                    }
                    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        continue;
                    }

                    if let Ok(message) = core::str::from_utf8(data) {
                        handle_mqtt_message(&plant, &sensors, topic, message);
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(plant: &Mutex<Plant>, sensors: &SensorCache, topic: &str, message: &str) {
    if let Some(sensor_id) = sensor_id_from_topic(topic) {
        if !sensors.record_payload(sensor_id, message, monotonic_ms()) {
            debug!("ignoring reading from unconfigured sensor {sensor_id}");
        }
        return;
    }

    if topic == TOPIC_CONTROLLER_CLEAR_FAULT {
        let mut plant = plant.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if plant.controller.is_faulted() {
            plant.controller.clear_fault();
            info!("actuation fault cleared");
        }
        return;
    }

    if topic == TOPIC_PRESENCE {
        let mut plant = plant.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        plant.controller.set_active_override(Some(message));
        info!(
            "presence override now {}",
            plant.controller.active_override().unwrap_or("none")
        );
    }
}

fn spawn_control_loop(
    plant: Arc<Mutex<Plant>>,
    sensors: SensorCache,
    timezone: Tz,
    config: Arc<HvacConfig>,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let poll_interval = Duration::from_millis(config.tuning().poll_interval_ms);

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_status_publish_ms: Option<u64> = None;

            loop {
                feed_watchdog();
                let started = Instant::now();
                let now_ms = monotonic_ms();
                let local = now_in_timezone(timezone);

                let (record, status) = {
                    let mut plant = plant.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    let Plant { controller, pins } = &mut *plant;
                    let record = controller.run_cycle(&sensors, pins, now_ms, local);
                    (record, controller.status(now_ms))
                };

                log_record(&record);
                if let Err(err) = publish_record(&mqtt, &record) {
                    warn!("decision publish failed: {err:#}");
                }

                let status_due = last_status_publish_ms.map_or(true, |last| {
                    now_ms.saturating_sub(last) >= STATUS_PUBLISH_INTERVAL_MS
                });
                if status_due {
                    last_status_publish_ms = Some(now_ms);
                    if let Err(err) = publish_status(&mqtt, &status) {
                        warn!("status publish failed: {err:#}");
                    }
                }

                let elapsed = started.elapsed();
                let mut remaining = poll_interval.saturating_sub(elapsed);
                while !remaining.is_zero() {
                    let nap = remaining.min(Duration::from_secs(5));
                    thread::sleep(nap);
                    feed_watchdog();
                    remaining = remaining.saturating_sub(nap);
                }
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn log_record(record: &DecisionRecord) {
    match (&record.fault, &record.fault_detail) {
        (Some(fault), detail) => error!(
            "{}: {} (now {})",
            fault.as_str(),
            detail.as_deref().unwrap_or(""),
            record.new_state
        ),
        (None, _) if record.transitioned() => info!(
            "{} -> {} (target {:?}, temp {:?})",
            record.previous_state,
            record.new_state,
            record.target.as_ref().map(|target| target.target_f),
            record.aggregated_temp_f
        ),
        (None, _) if record.degraded => warn!(
            "degraded reading, {} sensors excluded",
            record.excluded.len()
        ),
        (None, _) => debug!("holding {}", record.new_state),
    }
}

fn publish_record(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    record: &DecisionRecord,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(record)?;
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;

    if record.fault.is_some() {
        mqtt.publish(TOPIC_CONTROLLER_FAULT, QoS::AtLeastOnce, false, &body)?;
    }
    mqtt.publish(TOPIC_CONTROLLER_DECISION, QoS::AtMostOnce, false, &body)?;
    Ok(())
}

fn publish_status(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    status: &HvacStatus,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(status)?;
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    mqtt.publish(TOPIC_CONTROLLER_STATUS, QoS::AtLeastOnce, true, &body)?;
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
