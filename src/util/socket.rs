//! Socket utilities and tuning

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

/// Socket buffer sizes for bursty game traffic
pub const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024; // 4MB
pub const SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024; // 4MB

/// Create a bound, non-blocking UDP socket for a QUIC endpoint.
///
/// No address reuse: a second listener on the same port must fail to bind.
pub fn create_udp_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    // Kernels may clamp these; a smaller buffer is not fatal
    let _ = socket.set_recv_buffer_size(RECV_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(SEND_BUFFER_SIZE);

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}
