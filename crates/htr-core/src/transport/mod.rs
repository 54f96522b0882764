//! Transport layer module.

pub mod mock;
pub mod remote;
pub mod serial;
pub mod simulator;
pub mod traits;

pub use mock::MockConnector;
pub use remote::{
    AllocationRequirements, ClientRegistry, RemoteConfig, RemoteConnector, RemoteResource,
    ResourceManager,
};
pub use serial::{SerialConfig, SerialConnector};
pub use simulator::{SimulatorConfig, SimulatorConnector};
pub use traits::{Connector, TransportError};
