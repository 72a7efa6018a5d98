use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Result;

/// A loopback address nothing is listening on right now.
pub fn free_local_addr() -> Result<SocketAddr> {
    let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(probe.local_addr()?)
}
