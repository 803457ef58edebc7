//! Camera control channels.
//!
//! - `proto`: protobuf envelope exchanged over the channel
//! - `transport`: `Connector` seam and the WebSocket implementation
//! - `controller`: per-camera sessions, keepalive, reconnect and request correlation

pub mod controller;
pub mod proto;
pub mod transport;

pub use controller::{CameraStatus, ChannelState, StreamController, StreamError};
pub use transport::{Connector, WsConnector, DEFAULT_CONTROL_BASE_URL};
