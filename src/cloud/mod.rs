//! Cloud path: signed session handshake and command relay.

/// Vendor signed-request gateway
pub mod gateway;
/// Relay collaborator and cloud command correlation
pub mod relay;
/// Session handshake and post-login services
pub mod session;
/// Request signatures
pub mod signing;

pub use gateway::{GatewayRequest, GatewayResponse, HttpSignedGateway, SignedGateway};
pub use relay::{
    CloudCommandCorrelator, CloudDevice, GatewayRelay, Relay, RelayEvent, RelayEventStream,
    ThingEvent,
};
pub use session::{
    AepAuth, ClientIdentity, CloudGateway, CloudSession, DeviceBinding, RegionInfo,
    SessionTokens,
};
