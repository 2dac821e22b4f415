//! Tunable options for stream and datagram endpoints. All structs
//! deserialize with full defaults so they can be embedded in application
//! configuration files.

use serde::{Deserialize, Serialize};

/// Options shared by TCP/TLS servers, their sessions, and clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    /// Enable OS-level TCP keep-alive probes on each connection.
    pub keep_alive: bool,
    /// Disable Nagle's algorithm (`TCP_NODELAY`) on each connection.
    pub no_delay: bool,
    /// Set `SO_REUSEADDR` on the listener before binding.
    pub reuse_address: bool,
    /// Set `SO_REUSEPORT` on the listener before binding (Unix only).
    pub reuse_port: bool,
    /// Accept both IPv4 and IPv6 peers on an IPv6 listener.
    pub dual_mode: bool,
    /// Depth of the pending-connection queue passed to `listen`.
    pub accept_backlog: u32,
    /// Initial capacity of each session's receive buffer; also applied as
    /// the `SO_RCVBUF` hint. Zero leaves the OS default in place.
    pub receive_buffer_size: usize,
    /// Initial capacity of each session's send buffers; also applied as the
    /// `SO_SNDBUF` hint. Zero leaves the OS default in place.
    pub send_buffer_size: usize,
    /// Cap on receive-buffer growth. Zero means unbounded doubling.
    pub receive_buffer_limit: usize,
    /// Cap on bytes a session will queue for sending before `send_async`
    /// starts rejecting. Zero means unbounded.
    pub send_buffer_limit: usize,
}

impl Default for TcpSettings {
    fn default() -> TcpSettings {
        TcpSettings {
            keep_alive: false,
            no_delay: false,
            reuse_address: false,
            reuse_port: false,
            dual_mode: false,
            accept_backlog: 1024,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            receive_buffer_limit: 0,
            send_buffer_limit: 0,
        }
    }
}

/// Options for datagram endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSettings {
    /// Prepare the socket for multicast sending: apply the TTL and loopback
    /// options below after binding.
    pub multicast: bool,
    /// Hop limit for outgoing multicast datagrams.
    pub multicast_ttl: u32,
    /// Deliver our own multicast datagrams back to this host.
    pub multicast_loopback: bool,
    /// Set `SO_REUSEADDR` before binding, so several receivers can share a
    /// multicast port.
    pub reuse_address: bool,
    /// Capacity of the single receive slot; also applied as the `SO_RCVBUF`
    /// hint. Zero leaves the OS default in place (the slot still defaults to
    /// 8192 bytes).
    pub receive_buffer_size: usize,
    /// `SO_SNDBUF` hint. Zero leaves the OS default in place.
    pub send_buffer_size: usize,
    /// Cap on receive-slot growth. Zero means unbounded doubling.
    pub receive_buffer_limit: usize,
}

impl Default for UdpSettings {
    fn default() -> UdpSettings {
        UdpSettings {
            multicast: false,
            multicast_ttl: 1,
            multicast_loopback: true,
            reuse_address: false,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            receive_buffer_limit: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_settings_deserialize_with_defaults() {
        let settings: TcpSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.accept_backlog, 1024);
        assert_eq!(settings.receive_buffer_size, 8192);
        assert!(!settings.no_delay);

        let settings: TcpSettings =
            serde_json::from_str(r#"{ "no_delay": true, "accept_backlog": 16 }"#).unwrap();
        assert!(settings.no_delay);
        assert_eq!(settings.accept_backlog, 16);
    }

    #[test]
    fn udp_settings_deserialize_with_defaults() {
        let settings: UdpSettings = serde_json::from_str(r#"{ "multicast": true }"#).unwrap();
        assert!(settings.multicast);
        assert_eq!(settings.multicast_ttl, 1);
        assert!(settings.multicast_loopback);
    }
}
