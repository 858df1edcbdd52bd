//! Client library for Lutron's LEAP protocol, spoken by Caseta, RA2 Select,
//! RA3 and HomeWorks QSX bridges: pairing, connection lifecycle, a live
//! device/zone/area/button/occupancy model, and a command/observer API.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod pairing;
pub mod registry;
pub mod requester;

pub use bridge::{Bridge, BridgeState};
pub use config::Config;
pub use connection::Credentials;
pub use error::{LeapError, Result};
pub use model::{
    Area, BridgeFlavor, Button, ButtonEventType, ButtonGroup, Device, DeviceDomain, FanSpeed, Id,
    Occupancy, OccupancyGroup, Scene, Zone,
};
pub use pairing::{pair, write_credentials, PairingOptions, PairingResult};
pub use registry::SubscriptionHandle;
