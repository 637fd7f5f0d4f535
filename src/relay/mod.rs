pub mod client;
pub mod hub;
pub mod server;

pub use client::RelayClient;
pub use hub::{Connection, Hub};
pub use server::{RelayHandle, RelayServer};
