//! Transport layer of the event horizon: wire protocol, tunnels, the
//! singularity registry, the serving horizon and outbound connections.

pub mod barrier;
pub mod config;
pub mod connection;
pub mod horizon;
pub mod registry;
pub mod singularity;
pub mod tunnel;
pub mod wire;

pub use barrier::Barrier;
pub use config::{ConfigError, ConnectionConfig, HorizonConfig};
pub use connection::{Connection, ConnectionError, ConnectionState};
pub use horizon::{EventHorizon, HorizonError};
pub use registry::{PublishReport, SingularityRegistry};
pub use singularity::{RegistrationHandle, Singularity};
pub use tunnel::{Delivered, DeliveryError, StreamTunnel, Tunnel, TunnelId};
pub use wire::{ClientMessage, HandshakeError, OpenTunnelMessage, ServerMessage, WireError};
