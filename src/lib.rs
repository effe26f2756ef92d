pub mod relay;
pub mod utils;

pub use relay::server::RelayServer;
pub use relay::shutdown::{Shutdown, ShutdownTrigger, shutdown_channel};
pub use relay::state::{RelayConfig, ReplyMode, SessionScope};
