pub mod server;
pub mod wisp;
