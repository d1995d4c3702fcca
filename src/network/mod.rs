// Connection-oriented transport layer.
//
// Submodules:
// - `frame`: length-prefixed framing and the typed reader/writer
// - `codec`: protocol codec registry and payload codecs
// - `protocol`: handshake/heartbeat/data wire messages
// - `connection`: shared per-connection I/O tasks
// - `transport`: server side (connectors, bind, accept)
// - `client`: outbound connections
// - `ping`: liveness probe connector

pub mod client;
pub mod codec;
pub mod connection;
pub mod frame;
pub mod ping;
pub mod protocol;
pub mod transport;

pub use client::{ClientState, NetworkClient};
pub use codec::{CodecFactory, CodecRegistry, MessageCodec};
pub use connection::{ConnectionEvent, ConnectionSender};
pub use ping::{ping, PingHandler, PingResult, PING_PROTOCOL};
pub use protocol::{HeartbeatParams, TransportFrame};
pub use transport::{Connector, ConnectorHandler, NetworkTransport};
