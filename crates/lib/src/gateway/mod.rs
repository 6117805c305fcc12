//! Gateway: HTTP control plane for operators, the automation and the transport bridge.
//!
//! Single port. Control routes drive the ownership engine; `/transport/events` feeds the
//! relay's event queue; `/health` and `/metrics` report process state.

mod protocol;
mod server;

pub use protocol::{ControlError, NumberBody, OperatorSignalBody, SendMessageBody};
pub use server::{build_router, run_gateway, run_gateway_with, Collaborators, GatewayState};
