/*
[INPUT]:  Stream specs, callback bundles and stream configuration
[OUTPUT]: Supervised stream connections delivering typed events
[POS]:    WebSocket layer - real-time market and user data
[UPDATE]: When adding stream kinds or changing connection logic
*/

pub mod backoff;
pub mod callbacks;
pub mod client;
pub mod connection;
pub mod message;
pub mod registry;
pub mod sink;
pub mod stream;
pub mod transport;

pub use backoff::{BackoffConfig, BackoffState, JitterPolicy};
pub use callbacks::{CallbackBundle, CallbackBundleBuilder, HandlerError, HandlerResult};
pub use client::{StreamConfig, StreamingClient};
pub use connection::{ConnectionConfig, ConnectionHandle, ConnectionState};
pub use message::{ControlError, ControlReply, InboundMessage, StreamEvent, decode_frame};
pub use registry::{
    CombinedPolicy, ConnectionLoad, DedicatedPolicy, GroupingPolicy, Placement,
    SubscriptionHandle, SubscriptionRegistry,
};
pub use sink::ErrorSink;
pub use stream::{StreamSpec, USER_DATA_STREAM_ID};
pub use transport::{
    Connector, Frame, MemoryConnector, MemorySession, Transport, TungsteniteConnector,
};
