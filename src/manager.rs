use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use log::{debug, error, info, warn};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::battery::{self, GattBatteryReader};
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, ScanSettings};
use crate::messages::DevicePresence;
use crate::mode::{OperatingMode, OperatingModeMachine};
use crate::mqtt::{MqttClient, StatusMessage};
use crate::publish::{PublishAllFlag, PublishScheduler, ScannerIdentity};
use crate::registry::DeviceRegistry;
use crate::scanner::Scanner;

const MODE_TICK: Duration = Duration::from_millis(100);
const PUBLISH_TICK: Duration = Duration::from_secs(1);

/// Slack on top of the sensing window before the mode table forces resting.
const SENSING_GRACE_SECONDS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Restart,
}

pub struct Manager {
    config_path: PathBuf,
    config: AppConfig,
    settings: ScanSettings,
    started: Instant,
    sensing_until: Option<Instant>,
    clock: Arc<dyn Clock>,
    registry: Arc<Mutex<DeviceRegistry>>,
    mode: Arc<Mutex<OperatingModeMachine>>,
    scheduler: PublishScheduler,
    publish_all: PublishAllFlag,
    scanner: Arc<Scanner>,
    battery_reader: GattBatteryReader,
    battery_task: Option<JoinHandle<bool>>,
    mqtt: Option<MqttClient>,
    mqtt_event_loop: Option<rumqttc::EventLoop>,
}

/// (sensing, resting)
pub fn mode_timeouts(settings: &ScanSettings) -> (Duration, Duration) {
    (
        Duration::from_secs(settings.sensing_seconds + SENSING_GRACE_SECONDS),
        Duration::from_secs(settings.resting_seconds),
    )
}

pub fn sensing_over(mode: OperatingMode, sensing_until: Option<Instant>, now: Instant) -> bool {
    mode == OperatingMode::Sensing && sensing_until.is_some_and(|until| now >= until)
}

pub fn transport_enabled(mode: OperatingMode, connected: bool) -> bool {
    connected && !matches!(mode, OperatingMode::Provisioning | OperatingMode::None)
}

pub fn outcome_of(mode: OperatingMode) -> Option<RunOutcome> {
    (mode == OperatingMode::Restarting).then_some(RunOutcome::Restart)
}

/// First tick one period from now; missed ticks are skipped.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

// The broker connection and scanner identity are only read at startup.
pub fn needs_restart(current: &AppConfig, reloaded: &AppConfig) -> bool {
    current.mqtt != reloaded.mqtt || current.scanner_name() != reloaded.scanner_name()
}

impl Manager {
    pub async fn new(
        config_path: PathBuf,
        config: AppConfig,
        provision: bool,
        max_devices: usize,
    ) -> anyhow::Result<Self> {
        let settings = ScanSettings::from_config(&config);
        let scanner = Scanner::first_adapter().await?;
        let battery_reader = GattBatteryReader::new(scanner.adapter());

        let (mqtt, mqtt_event_loop) = match config.mqtt.as_ref() {
            Some(mqtt_config) if !provision => {
                let (client, eventloop) = MqttClient::new(mqtt_config, &config.publisher_id());
                (Some(client), Some(eventloop))
            }
            _ => (None, None),
        };

        let mut mode = OperatingModeMachine::new();
        mode.request_transition(if mqtt.is_some() {
            OperatingMode::Sensing
        } else {
            OperatingMode::Provisioning
        });

        let scheduler = PublishScheduler::new(
            &settings,
            ScannerIdentity {
                name: config.scanner_name(),
                client_id: config.publisher_id(),
            },
        );

        let mut manager = Manager {
            config_path,
            config,
            settings,
            started: Instant::now(),
            sensing_until: None,
            clock: Arc::new(SystemClock),
            registry: Arc::new(Mutex::new(DeviceRegistry::new(max_devices))),
            mode: Arc::new(Mutex::new(mode)),
            scheduler,
            publish_all: PublishAllFlag::default(),
            scanner: Arc::new(scanner),
            battery_reader,
            battery_task: None,
            mqtt,
            mqtt_event_loop,
        };
        manager.apply_settings().await;
        Ok(manager)
    }

    async fn apply_settings(&mut self) {
        let (sensing, resting) = mode_timeouts(&self.settings);
        info!(
            "Scanning for {}s every {}s, absent after {} cycles",
            self.settings.sensing_seconds,
            self.settings.cycle_seconds(),
            self.settings.absence_cycles
        );
        {
            let mut mode = self.mode.lock().await;
            mode.modify_timeout(OperatingMode::Sensing, sensing);
            mode.modify_timeout(OperatingMode::Resting, resting);
        }
        self.scheduler.apply_settings(&self.settings);
    }

    pub async fn run_loop(mut self) -> anyhow::Result<RunOutcome> {
        let (tx, mut control_rx) = mpsc::channel(10);

        if let (Some(client), Some(mut eventloop)) = (self.mqtt.clone(), self.mqtt_event_loop.take())
        {
            let publish_all = self.publish_all.clone();
            tokio::task::spawn(async move {
                client.event_loop(&mut eventloop, publish_all, tx).await;
            });
        }

        let scanner = self.scanner.clone();
        let registry = self.registry.clone();
        let mode = self.mode.clone();
        let clock = self.clock.clone();
        tokio::task::spawn(async move {
            if let Err(err) = scanner.run(registry, mode, clock).await {
                error!("Error handling BTLE events: {:?}", err);
            }
        });

        let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
        let mut mode_tick = ticker(MODE_TICK);
        let mut publish_tick = ticker(PUBLISH_TICK);
        let mut status_tick = self.status_interval();

        let outcome = loop {
            tokio::select! {
                _ = mode_tick.tick() => {
                    if let Some(outcome) = self.mode_tick().await {
                        break outcome;
                    }
                }
                _ = publish_tick.tick() => self.publish_tick().await,
                _ = status_tick.tick() => self.publish_status().await,
                Some(request) = control_rx.recv() => {
                    self.mode.lock().await.request_transition(request.target_mode());
                }
                _ = sighup.recv() => {
                    let period = self.settings.status_interval_seconds;
                    self.reload_config().await;
                    if period != self.settings.status_interval_seconds {
                        status_tick = self.status_interval();
                    }
                }
            }
        };

        if let Some(client) = &self.mqtt {
            if let Err(err) = client.disconnect() {
                warn!("Error disconnecting from MQTT broker: {:?}", err);
            }
        }
        Ok(outcome)
    }

    fn status_interval(&self) -> Interval {
        ticker(Duration::from_secs(self.settings.status_interval_seconds))
    }

    fn transport(&self, mode: OperatingMode) -> Option<&MqttClient> {
        self.mqtt
            .as_ref()
            .filter(|client| transport_enabled(mode, client.is_connected()))
    }

    async fn mode_tick(&mut self) -> Option<RunOutcome> {
        let now = Instant::now();
        let entered = {
            let mut mode = self.mode.lock().await;
            if sensing_over(mode.mode(), self.sensing_until, now) {
                mode.request_transition(OperatingMode::Resting);
            }
            mode.tick(now)?
        };
        self.enter_mode(entered, now).await
    }

    async fn enter_mode(&mut self, mode: OperatingMode, now: Instant) -> Option<RunOutcome> {
        if mode != OperatingMode::Sensing {
            self.sensing_until = None;
        }
        match mode {
            OperatingMode::Sensing => {
                self.sensing_until = Some(now + Duration::from_secs(self.settings.sensing_seconds));
                if let Err(err) = self.scanner.start().await {
                    error!("Error starting scan: {:?}", err);
                }
            }
            OperatingMode::Resting => {
                self.stop_scan().await;
                self.log_listing().await;
            }
            OperatingMode::Provisioning => {
                self.stop_scan().await;
                warn!(
                    "Waiting for provisioning: write the [mqtt] section to {} and send SIGHUP",
                    self.config_path.display()
                );
            }
            OperatingMode::PendingRestart => {
                self.stop_scan().await;
                info!("Restart pending");
            }
            OperatingMode::Restarting | OperatingMode::None => {}
        }
        outcome_of(mode)
    }

    async fn stop_scan(&self) {
        if let Err(err) = self.scanner.stop().await {
            debug!("Error stopping scan: {:?}", err);
        }
    }

    async fn log_listing(&self) {
        let (listing, capacity) = {
            let registry = self.registry.lock().await;
            if registry.is_empty() {
                info!("No devices seen yet");
                return;
            }
            (registry.listing(), registry.capacity())
        };
        let present = listing
            .iter()
            .filter(|row| row.presence == DevicePresence::Present)
            .count();
        info!(
            "{}/{} devices known, {} present",
            listing.len(),
            capacity,
            present
        );
        for row in &listing {
            debug!("{row}");
        }
    }

    async fn publish_tick(&mut self) {
        let mode = self.mode.lock().await.mode();
        // While disconnected nothing is taken off the registry; the full
        // snapshot after the next ConnAck catches the broker up.
        let Some(client) = self.transport(mode) else {
            return;
        };

        let battery_idle = self
            .battery_task
            .as_ref()
            .is_none_or(|task| task.is_finished());
        let publish_all = self.publish_all.take();
        let now = self.clock.now();
        let outcome = {
            let mut registry = self.registry.lock().await;
            self.scheduler.tick(&mut registry, now, publish_all, battery_idle)
        };

        for report in &outcome.reports {
            if let Err(err) = client.publish_report(report) {
                // The report's dirty bits are already cleared, so ask for a
                // full snapshot instead of losing it.
                error!("Error publishing {}: {:?}", report.key, err);
                self.publish_all.raise();
            }
        }

        if let Some(address) = outcome.battery_poll {
            let reader = self.battery_reader.clone();
            let registry = self.registry.clone();
            self.battery_task = Some(tokio::task::spawn(async move {
                battery::poll(&reader, &registry, address).await
            }));
        }
    }

    async fn publish_status(&self) {
        let mode = self.mode.lock().await.mode();
        let Some(client) = self.transport(mode) else {
            return;
        };

        let status = StatusMessage {
            state: "connected",
            mode: mode.to_string(),
            devices: self.registry.lock().await.len(),
            uptime: self.started.elapsed().as_secs(),
        };
        match client.publish_status(&status) {
            Ok(()) => self.publish_all.raise(),
            Err(err) => error!("Error publishing status: {:?}", err),
        }
    }

    async fn reload_config(&mut self) {
        info!("Reloading {}", self.config_path.display());
        let reloaded = match AppConfig::load(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                error!("Keeping current configuration: {:#}", err);
                return;
            }
        };

        // While provisioning there is no broker connection yet, so any
        // complete configuration means starting over.
        let restart = !reloaded.needs_provisioning()
            && (self.mqtt.is_none() || needs_restart(&self.config, &reloaded));
        self.settings = ScanSettings::from_config(&reloaded);
        self.config = reloaded;
        self.apply_settings().await;

        if restart {
            info!("Broker settings or scanner identity changed, restarting");
            self.mode
                .lock()
                .await
                .request_transition(OperatingMode::PendingRestart);
        }
    }
}
