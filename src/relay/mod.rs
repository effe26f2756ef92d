// Relay engine: control connections multiplexed onto outbound sessions
pub mod codec;
pub mod control;
pub mod protocol;
pub mod reply;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod table;
