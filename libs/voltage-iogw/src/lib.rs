//! VoltageEMS I/O Gateway Protocol
//!
//! Device protocol layer for cellular/LoRaWAN I/O gateways reporting over a
//! publish/subscribe broker:
//!
//! - **Decoding**: [`envelope`] strips one of three wire variants, [`channel`]
//!   decodes the tagged channel stream against a static rule table and
//!   [`report`] folds channels into typed reports. Decoding is pure and
//!   shares no mutable state.
//! - **Validation**: [`validator`] attaches advisory checks to a decoded
//!   report.
//! - **Commands**: [`command`] builds control frames; [`session`] gates them
//!   behind the password handshake and pairs them with their asynchronous
//!   replies.
//! - **Routing**: [`ingest`] is the single entry point for inbound broker
//!   messages.
//!
//! The broker client itself stays outside; it plugs in through
//! [`transport::Publisher`].

pub mod bytes;
pub mod channel;
pub mod command;
pub mod envelope;
pub mod error;
pub mod ingest;
pub mod report;
pub mod session;
pub mod topic;
pub mod transport;
pub mod validator;

pub use channel::{decode_channels, AnalogMode, AnalogReading, DigitalStates, Value};
pub use command::{
    Command, CommandBuilder, CommandFrame, CommandType, CorrelationKey, OutputState, QueryParam,
    Response, ResponseMatcher,
};
pub use envelope::{encode_frame, parse_envelope, Envelope, WireVariant};
pub use error::{BuildError, CommandError, CommandResult, DecodeError, DecodeResult, TransportError};
pub use ingest::{IngestRouter, Ingested};
pub use report::{decode, decode_raw, DecodedReport, RawFrame, ReportBody, ReportType};
pub use session::{AuthState, SessionConfig, SessionManager};
pub use topic::TopicTemplate;
pub use transport::{MemoryPublisher, Publisher};
pub use validator::{validate, PayloadValidator, ValidationResult, ValidatorConfig};
