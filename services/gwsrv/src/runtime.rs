//! Service wiring and lifecycle

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use voltage_iogw::{IngestRouter, PayloadValidator, Publisher, SessionManager};

use crate::cli::DeviceCommand;
use crate::commands::execute_command;
use crate::config::GatewayConfig;
use crate::mqtt::{self, MqttPublisher, UplinkHandler};

/// Session manager with the configured passwords applied
pub fn build_sessions<P: Publisher>(
    config: &GatewayConfig,
    publisher: Arc<P>,
) -> SessionManager<P> {
    let mut sessions = SessionManager::new(
        publisher,
        config.topics.downlink.clone(),
        config.session_config(),
    );
    if let Some(password) = &config.default_password {
        sessions = sessions.with_default_password(password.clone());
    }
    for (device_id, device) in &config.devices {
        if let Some(password) = &device.password {
            sessions = sessions.with_device_password(device_id.clone(), password.clone());
        }
    }
    sessions
}

pub fn build_router<P: Publisher>(
    config: &GatewayConfig,
    sessions: Arc<SessionManager<P>>,
) -> IngestRouter<P> {
    IngestRouter::new(
        config.topics.uplink.clone(),
        sessions,
        PayloadValidator::new(config.validation.clone()),
    )
}

/// A running broker link
pub struct Gateway {
    router: Arc<IngestRouter<MqttPublisher>>,
    client: rumqttc::AsyncClient,
    connected: watch::Receiver<bool>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Connect to the broker and start the uplink and sweeper tasks
    pub fn start(config: &GatewayConfig) -> Self {
        let (client, eventloop) = mqtt::connect(&config.mqtt);
        let qos = mqtt::qos_from_level(config.mqtt.qos);
        let (connected_tx, connected) = watch::channel(false);

        let publisher = Arc::new(MqttPublisher::new(client.clone(), qos, connected.clone()));
        let sessions = Arc::new(build_sessions(config, publisher));
        let router = Arc::new(build_router(config, sessions.clone()));

        let token = CancellationToken::new();
        let handler = UplinkHandler::new(
            router.clone(),
            client.clone(),
            config.subscribe_filter(),
            qos,
            Duration::from_millis(config.mqtt.reconnect_delay_ms),
            connected_tx,
        );
        let uplink = tokio::spawn(handler.run(eventloop, token.clone()));
        let sweeper = sessions.spawn_sweeper(token.clone());

        info!(
            "Gateway started: broker {}:{}, uplink {}, downlink {}",
            config.mqtt.host, config.mqtt.port, config.topics.uplink, config.topics.downlink
        );

        Self {
            router,
            client,
            connected,
            token,
            tasks: vec![uplink, sweeper],
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<MqttPublisher>> {
        self.router.sessions()
    }

    /// Wait until the uplink subscription is acknowledged
    pub async fn wait_ready(&mut self, limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, self.connected.wait_for(|ready| *ready))
            .await
            .context("timed out connecting to MQTT broker")?
            .context("MQTT uplink stopped")?;
        Ok(())
    }

    pub async fn shutdown(self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT disconnect failed: {}", e);
        }
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Gateway task ended abnormally: {}", e);
            }
        }
        info!("Gateway stopped");
    }
}

/// Run until Ctrl+C or SIGTERM
pub async fn run(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::start(&config);

    let signal = common::wait_for_shutdown().await;
    info!("{} received, shutting down", signal);

    gateway.shutdown().await;
    Ok(())
}

/// Connect, run one device command, disconnect
pub async fn run_command(
    config: GatewayConfig,
    device_id: &str,
    action: &DeviceCommand,
) -> Result<JsonValue> {
    let mut gateway = Gateway::start(&config);

    let outcome = match gateway.wait_ready(config.session_config().auth_timeout).await {
        Ok(()) => execute_command(gateway.sessions(), device_id, action).await,
        Err(e) => Err(e),
    };

    gateway.shutdown().await;
    outcome
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use voltage_iogw::{AuthState, MemoryPublisher};

    #[tokio::test(start_paused = true)]
    async fn test_device_password_overrides_default() {
        let mut config = GatewayConfig {
            default_password: Some("123456".to_string()),
            ..Default::default()
        };
        config.devices.insert(
            "GW-0002".to_string(),
            DeviceConfig {
                password: Some("654321".to_string()),
            },
        );
        let sessions = build_sessions(&config, Arc::new(MemoryPublisher::new()));

        let default_frame = sessions.builder_for("GW-0001").password_frame().unwrap();
        let device_frame = sessions.builder_for("GW-0002").password_frame().unwrap();
        assert_eq!(&default_frame.payload[5..11], b"123456");
        assert_eq!(&device_frame.payload[5..11], b"654321");
        assert_eq!(sessions.auth_state("GW-0002"), AuthState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_password_configured() {
        let publisher = Arc::new(MemoryPublisher::new());
        let sessions = build_sessions(&GatewayConfig::default(), Arc::clone(&publisher));
        assert!(!sessions.builder_for("GW-0001").has_password());
        assert!(sessions.authenticate("GW-0001").await.is_err());
        assert_eq!(publisher.count(), 0);
    }

    #[test]
    fn test_router_uses_configured_uplink() {
        let mut config = GatewayConfig::default();
        config.topics.uplink = voltage_iogw::TopicTemplate::parse("iogw/{device_id}").unwrap();
        let sessions = Arc::new(build_sessions(&config, Arc::new(MemoryPublisher::new())));
        let router = build_router(&config, sessions);

        let frame = voltage_iogw::RawFrame::new("gw/GW-0001/up", vec![0x7E]);
        assert!(matches!(
            router.ingest(&frame),
            voltage_iogw::Ingested::UnroutableTopic { .. }
        ));
        let frame = voltage_iogw::RawFrame::new("iogw/GW-0001", vec![0x7E]);
        assert!(matches!(
            router.ingest(&frame),
            voltage_iogw::Ingested::Rejected { .. }
        ));
    }
}
