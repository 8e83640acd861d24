// L4 原子层模块入口

pub mod error;
pub mod fd_channel;
pub mod logger;
pub mod platform;
pub mod private_ranges;
pub mod process_guard;
pub mod shared_types;
pub mod shutdown;

pub use error::{VpnError, VpnResult};
pub use fd_channel::{DescriptorChannel, HANDOFF_FRAMING_BYTE};
pub use logger::init;
pub use platform::{NetworkCallback, NetworkEvent, NetworkPlatform, NetworkRequestId};
pub use process_guard::{FatalCallback, GuardedProcessPool, ProcessSupervisor, RestartCallback};
pub use shared_types::{InterfaceConfig, Network, RouteMode, RoutingPolicy};
