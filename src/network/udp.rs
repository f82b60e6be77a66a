//! UDP socket setup
//!
//! Sockets are built through socket2 so buffer sizes and address reuse can
//! be set before binding, then handed out as std sockets.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::NetworkError;

/// Kernel buffer size requested for both directions
const SOCKET_BUFFER_SIZE: usize = 1 << 20;

fn new_socket(addr: &SocketAddr) -> Result<Socket, NetworkError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    // Buffer sizes are hints; the kernel may clamp them
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("Could not set receive buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("Could not set send buffer size: {}", e);
    }
    Ok(socket)
}

/// Bind a listening socket; `read_timeout` bounds every blocking receive
pub fn bind_listener(addr: SocketAddr, read_timeout: Duration) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket(&addr)?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
    socket
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let socket: UdpSocket = socket.into();
    info!(
        "Listening for RTP on {}",
        socket.local_addr().map_or(addr, |a| a)
    );
    Ok(socket)
}

/// Socket connected to `destination`, bound to an ephemeral local port
pub fn connect_sender(destination: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket(&destination)?;
    let local: SocketAddr = if destination.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    socket
        .bind(&local.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .connect(&destination.into())
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", destination, e)))?;

    info!("Sending RTP to {}", destination);
    Ok(socket.into())
}

/// Whether a receive error only means the read timeout elapsed
pub fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_times_out() {
        let socket =
            bind_listener("127.0.0.1:0".parse().unwrap(), Duration::from_millis(20)).unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_sender_reaches_listener() {
        let listener =
            bind_listener("127.0.0.1:0".parse().unwrap(), Duration::from_millis(500)).unwrap();
        let sender = connect_sender(listener.local_addr().unwrap()).unwrap();

        sender.send(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = listener.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
