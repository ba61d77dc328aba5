pub mod delivery;
pub mod engine;
pub mod message;
pub mod retained;
pub mod session;
pub mod topic;

pub use engine::{Broker, ConnectError, SharedBroker, lock_broker};
pub use message::Message;

#[cfg(test)]
mod tests;
