//! Process surface of the `fleet-mirror` binary

pub mod health;
pub mod shutdown;
pub mod startup;
