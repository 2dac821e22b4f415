//! Plain stream-socket endpoints: the accepting server and the outbound
//! client.

pub mod client;
pub mod server;

pub use client::TcpClient;
pub use server::TcpServer;
