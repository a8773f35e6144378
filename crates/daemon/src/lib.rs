// tether-daemon: connection-stability coordinator for one messaging session
// shared by several replicas.

pub mod auth_state;
pub mod auto_heal;
pub mod bootstrap;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod disconnect_guard;
pub mod gate;
pub mod health;
pub mod incidents;
pub mod keepalive;
pub mod lease;
pub mod outbox;
pub mod reconnect;
pub mod runtime;
pub mod socket;
pub mod status;
pub mod store;
pub mod tasks;
pub mod watchdog;

#[cfg(test)]
mod test_support;
