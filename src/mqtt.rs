use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{LastWill, MqttOptions, QoS};
use serde_derive::Serialize;
use tokio::sync::mpsc;

use crate::config;
use crate::messages::{ControlRequest, DeviceReport};
use crate::publish::PublishAllFlag;

/// Seconds to wait after a failed connection attempt before polling again.
const RECONNECT_DELAY_SECONDS: u64 = 5;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topic_path: String,
    connected: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
pub struct StatusMessage {
    pub state: &'static str,
    pub mode: String,
    pub devices: usize,
    pub uptime: u64,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig, publisher_id: &str) -> (Self, rumqttc::EventLoop) {
        let topic_path = config.topic_path();

        let mut mqttoptions =
            MqttOptions::new(publisher_id.to_string(), config.host.clone(), config.port());

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));
        mqttoptions.set_last_will(LastWill::new(
            status_topic(&topic_path),
            r#"{"state":"disconnected"}"#,
            QoS::ExactlyOnce,
            true,
        ));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                topic_path,
                connected: Arc::default(),
            },
            eventloop,
        )
    }

    pub fn control_topic(&self) -> String {
        format!("{}/control", self.topic_path)
    }

    pub fn device_topic(&self, key: &str) -> String {
        format!("{}/device/{}", self.topic_path, key)
    }

    /// Whether the broker has acknowledged the current connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // Runs inside the event loop task, so nothing here may wait on the
    // request queue that task is supposed to drain.
    fn on_connected(&self) -> Result<(), rumqttc::ClientError> {
        self.client.try_publish(
            format!("{}/state", status_topic(&self.topic_path)),
            QoS::AtLeastOnce,
            true,
            "connected",
        )?;
        self.client
            .try_subscribe(self.control_topic(), QoS::AtMostOnce)
    }

    /// Drive the connection. Runs until the client is dropped; connection
    /// errors are logged and retried after a short delay.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        publish_all: PublishAllFlag,
        tx: mpsc::Sender<ControlRequest>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        match ControlRequest::parse(&p.payload) {
                            Some(request) => {
                                info!("Control request: {:?}", request);
                                if let Err(err) = tx.send(request).await {
                                    error!("Error forwarding control request: {:?}", err);
                                }
                            }
                            None => warn!("Ignoring unknown control message {:?}", p.payload),
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                        self.connected.store(true, Ordering::SeqCst);
                        publish_all.raise();
                        if let Err(err) = self.on_connected() {
                            error!("Error announcing MQTT connection: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    error!(
                        "Error polling MQTT event loop: {:?}, trying again in {}s",
                        e, RECONNECT_DELAY_SECONDS
                    );
                    tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECONDS)).await;
                }
            }
        }
    }

    /// Queue a report without waiting. Fails straight away when the request
    /// queue is full, e.g. while the broker is unreachable.
    pub fn publish_report(&self, report: &DeviceReport) -> Result<(), rumqttc::ClientError> {
        self.client.try_publish(
            self.device_topic(&report.key),
            QoS::AtMostOnce,
            false,
            report.payload(),
        )
    }

    pub fn publish_status(&self, status: &StatusMessage) -> anyhow::Result<()> {
        self.client.try_publish(
            status_topic(&self.topic_path),
            QoS::AtMostOnce,
            false,
            serde_json::to_string(status)?,
        )?;
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.try_disconnect()
    }
}

fn status_topic(topic_path: &str) -> String {
    format!("{topic_path}/status")
}
