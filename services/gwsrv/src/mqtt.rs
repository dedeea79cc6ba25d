//! MQTT transport for the gateway
//!
//! [`MqttPublisher`] carries command frames to the broker. [`UplinkHandler`]
//! drives the rumqttc event loop and hands every uplink message to the
//! ingest router.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voltage_iogw::{IngestRouter, Ingested, Publisher, RawFrame, TransportError};

use crate::config::MqttConfig;
use crate::report_json;

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    options
}

/// Create the client handle and its event loop
pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    AsyncClient::new(mqtt_options(config), config.channel_capacity)
}

/// Downlink publisher
///
/// Refuses to publish while the broker link is down, so a command fails
/// with a transport error instead of queueing behind a dead connection.
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    connected: watch::Receiver<bool>,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, qos: QoS, connected: watch::Receiver<bool>) -> Self {
        Self {
            client,
            qos,
            connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::new(topic, "not connected to MQTT broker"));
        }

        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| TransportError::new(topic, e.to_string()))?;

        debug!("Published command to {}", topic);
        Ok(())
    }
}

/// Feeds broker events into the ingest router
pub struct UplinkHandler<P> {
    router: Arc<IngestRouter<P>>,
    client: AsyncClient,
    filter: String,
    qos: QoS,
    reconnect_delay: Duration,
    connected: watch::Sender<bool>,
}

impl<P: Publisher> UplinkHandler<P> {
    pub fn new(
        router: Arc<IngestRouter<P>>,
        client: AsyncClient,
        filter: String,
        qos: QoS,
        reconnect_delay: Duration,
        connected: watch::Sender<bool>,
    ) -> Self {
        Self {
            router,
            client,
            filter,
            qos,
            reconnect_delay,
            connected,
        }
    }

    /// Poll until `token` is cancelled
    ///
    /// Connection errors are logged and polling resumes after the reconnect
    /// delay; rumqttc reconnects on the next poll.
    pub async fn run(self, mut eventloop: EventLoop, token: CancellationToken) {
        info!("MQTT uplink listening on {}", self.filter);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("MQTT uplink stopped");
                    break;
                }
                polled = eventloop.poll() => match polled {
                    Ok(event) => {
                        self.handle_event(event);
                    },
                    Err(e) => {
                        self.on_connection_lost(&e.to_string());
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    },
                }
            }
        }
        self.connected.send_replace(false);
    }

    /// Handle one event; returns the ingest outcome for uplink publishes
    pub fn handle_event(&self, event: Event) -> Option<Ingested> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("MQTT connected ({:?})", ack.code);
                // Broker sessions are clean; any earlier device login is void
                self.router.sessions().reset_all();
                if let Err(e) = self.client.try_subscribe(self.filter.as_str(), self.qos) {
                    error!("Subscribe to {} failed: {}", self.filter, e);
                }
                None
            },
            Event::Incoming(Packet::SubAck(_)) => {
                info!("Subscribed to {}", self.filter);
                self.connected.send_replace(true);
                None
            },
            Event::Incoming(Packet::Publish(publish)) => {
                let frame = RawFrame::new(publish.topic, publish.payload.to_vec());
                let outcome = self.router.ingest(&frame);
                log_outcome(&outcome);
                Some(outcome)
            },
            Event::Incoming(Packet::Disconnect) => {
                self.on_connection_lost("broker sent disconnect");
                None
            },
            _ => None,
        }
    }

    fn on_connection_lost(&self, reason: &str) {
        warn!("MQTT connection lost: {}", reason);
        self.connected.send_replace(false);
        self.router.sessions().reset_all();
    }
}

fn log_outcome(outcome: &Ingested) {
    match outcome {
        Ingested::Report { report, validation } => {
            info!("{}", report_json(report, validation));
        },
        Ingested::Response { device_id } => {
            debug!("Device {} response delivered", device_id);
        },
        Ingested::UnmatchedResponse {
            device_id,
            payload_type,
        } => {
            debug!(
                "Device {} response 0x{:02X} matched nothing",
                device_id, payload_type
            );
        },
        // The router already logged these
        Ingested::Rejected { .. } | Ingested::UnroutableTopic { .. } => {},
    }
}
