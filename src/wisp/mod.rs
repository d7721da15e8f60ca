//! Wisp protocol server for proxying TCP/UDP connections.
//!
//! Web clients speak Wisp over a WebSocket and the multiplexer in `wisp-mux`
//! turns their streams into real sockets, subject to the policy in [`WispConfig`].
//! The legacy wsproxy endpoint pipes a single WebSocket to a single TCP target.

mod auth;
mod config;
mod dialer;
mod handler;
mod resolver;
mod wsproxy;

pub use auth::StaticAuthenticator;
pub use config::{ConfigError, ThrottleSettings, WispConfig};
pub use dialer::PolicyDialer;
pub use handler::{WispState, wisp_ws_handler};
pub use wsproxy::{parse_target, wsproxy_handler};
