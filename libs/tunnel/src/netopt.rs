//! TCP socket tuning for tunnel connections.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::config::AdvancedConfig;

/// Applies the configured TCP options to a tunnel socket.
///
/// Buffer sizes of zero keep the OS defaults.
pub fn tune_stream(stream: &TcpStream, advanced: &AdvancedConfig) -> io::Result<()> {
    stream.set_nodelay(advanced.tcp_nodelay)?;

    let socket = SockRef::from(stream);

    if advanced.tcp_keepalive > 0 {
        socket.set_tcp_keepalive(
            &TcpKeepalive::new().with_time(Duration::from_secs(advanced.tcp_keepalive)),
        )?;
    }

    if advanced.tcp_read_buffer > 0 {
        socket.set_recv_buffer_size(advanced.tcp_read_buffer)?;
    }
    if advanced.tcp_write_buffer > 0 {
        socket.set_send_buffer_size(advanced.tcp_write_buffer)?;
    }

    Ok(())
}
