//! Proxy listeners, request dispatch and CONNECT tunnels

mod codec;
mod handler;
mod response;
mod server;
mod tunnel;

pub use codec::{read_request_head, MAX_HEAD_BYTES};
pub use handler::{ProxyHandler, RequestLog};
pub use response::ProxyBody;
pub use server::{BoundAddresses, ProxyServer};
pub use tunnel::{TunnelHandler, TunnelState};
