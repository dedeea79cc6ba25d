//! Inbound message routing
//!
//! One call per broker message: resolve the device from the topic, let the
//! device's session claim command responses, decode and validate the rest.
//! A bad frame only affects its own result.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bytes::encode_upper;
use crate::command::{CommandType, RESPONSE_OFFSET};
use crate::envelope::parse_envelope;
use crate::error::DecodeError;
use crate::report::{decode_envelope, DecodedReport, RawFrame};
use crate::session::SessionManager;
use crate::topic::TopicTemplate;
use crate::transport::Publisher;
use crate::validator::{PayloadValidator, ValidationResult};

/// Outcome of routing one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Telemetry decoded, with validation advisories
    Report {
        report: DecodedReport,
        validation: ValidationResult,
    },
    /// Consumed by a waiting command
    Response { device_id: String },
    /// Response type with nothing waiting for it (late or duplicate)
    UnmatchedResponse { device_id: String, payload_type: u8 },
    Rejected {
        device_id: String,
        error: DecodeError,
    },
    /// Topic does not carry a device id
    UnroutableTopic { topic: String },
}

pub struct IngestRouter<P> {
    uplink: TopicTemplate,
    sessions: Arc<SessionManager<P>>,
    validator: PayloadValidator,
}

impl<P: Publisher> IngestRouter<P> {
    pub fn new(
        uplink: TopicTemplate,
        sessions: Arc<SessionManager<P>>,
        validator: PayloadValidator,
    ) -> Self {
        Self {
            uplink,
            sessions,
            validator,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<P>> {
        &self.sessions
    }

    pub fn ingest(&self, frame: &RawFrame) -> Ingested {
        let Some(device_id) = self.uplink.extract(&frame.topic) else {
            debug!("No device id in topic {}", frame.topic);
            return Ingested::UnroutableTopic {
                topic: frame.topic.clone(),
            };
        };

        let envelope = match parse_envelope(&frame.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.sessions.sweep_device(device_id);
                warn!(
                    "Device {} frame rejected: {} ({})",
                    device_id,
                    error,
                    encode_upper(&frame.payload)
                );
                return Ingested::Rejected {
                    device_id: device_id.to_string(),
                    error,
                };
            },
        };

        if self.sessions.on_envelope(device_id, &envelope) {
            return Ingested::Response {
                device_id: device_id.to_string(),
            };
        }

        if is_response_type(envelope.payload_type) {
            debug!(
                "Device {} unmatched response {:#04X}",
                device_id, envelope.payload_type
            );
            return Ingested::UnmatchedResponse {
                device_id: device_id.to_string(),
                payload_type: envelope.payload_type,
            };
        }

        match decode_envelope(device_id, &envelope, frame.received_at) {
            Ok(report) => {
                let validation = self.validator.validate(&report);
                if !validation.valid {
                    warn!(
                        "Device {} {:?} report failed validation: {}",
                        device_id,
                        report.report_type(),
                        validation.errors.join("; ")
                    );
                }
                Ingested::Report { report, validation }
            },
            Err(error) => {
                warn!("Device {} frame rejected: {}", device_id, error);
                Ingested::Rejected {
                    device_id: device_id.to_string(),
                    error,
                }
            },
        }
    }
}

fn is_response_type(payload_type: u8) -> bool {
    payload_type
        .checked_add(RESPONSE_OFFSET)
        .and_then(CommandType::from_code)
        .is_some()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::command::{encode_ack, CorrelationKey};
    use crate::envelope::encode_frame;
    use crate::report::payload_type;
    use crate::session::{AuthState, SessionConfig};
    use crate::transport::MemoryPublisher;
    use tracing_test::traced_test;

    fn router() -> (Arc<MemoryPublisher>, IngestRouter<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new());
        let sessions = SessionManager::new(
            Arc::clone(&publisher),
            TopicTemplate::parse("gw/{device_id}/down").unwrap(),
            SessionConfig::default(),
        )
        .with_default_password("123456");
        let router = IngestRouter::new(
            TopicTemplate::parse("gw/{device_id}/up").unwrap(),
            Arc::new(sessions),
            PayloadValidator::default(),
        );
        (publisher, router)
    }

    #[test]
    fn test_report_routed_and_validated() {
        let (_, router) = router();
        let payload = encode_frame(payload_type::REGULAR, &[0x01, 0x07, 0x10, 0x03, 0x01, 0x05]);
        match router.ingest(&RawFrame::new("gw/GW-7/up", payload)) {
            Ingested::Report { report, validation } => {
                assert_eq!(report.device_id, "GW-7");
                assert!(validation.valid);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    #[traced_test]
    fn test_invalid_report_still_delivered() {
        let (_, router) = router();
        let payload = encode_frame(payload_type::REGULAR, &[0x01, 0x07, 0x28]);
        match router.ingest(&RawFrame::new("gw/GW-7/up", payload)) {
            Ingested::Report { report, validation } => {
                assert_eq!(report.device_id, "GW-7");
                assert!(!validation.valid);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(logs_contain("failed validation"));
    }

    #[test]
    fn test_bad_frame_does_not_stop_the_next() {
        let (_, router) = router();
        let bad = router.ingest(&RawFrame::new("gw/GW-7/up", vec![0x7E, 0x01]));
        assert!(matches!(
            bad,
            Ingested::Rejected {
                error: DecodeError::TooShort { .. },
                ..
            }
        ));

        let unsupported = router.ingest(&RawFrame::new("gw/GW-7/up", encode_frame(0xA0, &[])));
        assert!(matches!(
            unsupported,
            Ingested::Rejected {
                error: DecodeError::UnsupportedReportType(0xA0),
                ..
            }
        ));

        let good = encode_frame(payload_type::REGULAR, &[0x03, 0x01, 0x01]);
        assert!(matches!(
            router.ingest(&RawFrame::new("gw/GW-7/up", good)),
            Ingested::Report { .. }
        ));
    }

    #[test]
    fn test_unroutable_topic() {
        let (_, router) = router();
        let frame = RawFrame::new("other/GW-7/status", vec![0x7E]);
        assert_eq!(
            router.ingest(&frame),
            Ingested::UnroutableTopic {
                topic: "other/GW-7/status".to_string()
            }
        );
    }

    #[test]
    fn test_late_response_not_decoded_as_report() {
        let (_, router) = router();
        let ack = encode_ack(&CorrelationKey::AUTH, None, true);
        assert_eq!(
            router.ingest(&RawFrame::new("gw/GW-7/up", ack)),
            Ingested::UnmatchedResponse {
                device_id: "GW-7".to_string(),
                payload_type: 0xD1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_ack_consumed_by_session() {
        let (publisher, router) = router();
        let sessions = Arc::clone(router.sessions());
        let ack = encode_ack(&CorrelationKey::AUTH, None, true);

        let (ok, routed) = tokio::join!(sessions.authenticate("GW-7"), async {
            publisher.wait_for(1).await;
            router.ingest(&RawFrame::new("gw/GW-7/up", ack))
        });
        assert!(ok.unwrap());
        assert_eq!(
            routed,
            Ingested::Response {
                device_id: "GW-7".to_string()
            }
        );
        assert_eq!(sessions.auth_state("GW-7"), AuthState::Authenticated);
    }
}
