pub mod cadence;
pub mod command;
pub mod config;
pub mod error;
pub mod identity;
pub mod node;
pub mod provisioning;
pub mod screen;
pub mod store;
pub mod traits;
pub mod types;

pub use cadence::{Cadence, LoopAction, LoopScheduler};
pub use command::{decode_response, CommandEnvelope, RemoteCommand};
pub use config::NodeConfig;
pub use error::{DisplayError, ProvisioningError, SensorError, StoreError, TransportError};
pub use node::{DeviceState, Node, Poll, RestartLatch};
pub use provisioning::{plan_boot, BootMode, BootPlan, ProvisioningForm};
pub use screen::Screen;
pub use store::{KvStore, MemoryStore};
pub use traits::{ReportTransport, SensorReader, StatusDisplay};
pub use types::{ConnectionStatus, HttpReply, ReadingReport};
