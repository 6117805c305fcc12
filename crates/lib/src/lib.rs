//! Handover core library — conversation ownership between a human operator and an automation
//! bot, takeover timers, automation webhooks, snapshots and the HTTP control plane.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod init;
pub mod metrics;
pub mod ownership;
pub mod persistence;
pub mod relay;
pub mod session;
pub mod transport;
