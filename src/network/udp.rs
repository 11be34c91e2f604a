//! Low-level UDP socket handling
//!
//! The voice socket is built with socket2 so buffer sizes can be tuned before
//! it is handed to tokio and connected to the voice endpoint.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use tokio::net::UdpSocket as TokioUdpSocket;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Re-export for convenience
pub type UdpSocket = TokioUdpSocket;

/// Create a configured UDP socket in the address family of `remote`
pub fn create_socket(config: &NetworkConfig, remote: SocketAddr) -> Result<StdUdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    configure_socket(&socket, config)?;

    let addr = SocketAddr::new(bind_ip(config, remote), 0);
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let std_socket: StdUdpSocket = socket.into();
    std_socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(std_socket)
}

/// Create async UDP socket for tokio, connected to `remote`
pub async fn create_connected_socket(
    config: &NetworkConfig,
    remote: SocketAddr,
) -> Result<TokioUdpSocket, NetworkError> {
    let std_socket = create_socket(config, remote)?;
    let socket = TokioUdpSocket::from_std(std_socket)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .connect(remote)
        .await
        .map_err(|e| NetworkError::ConnectFailed {
            addr: remote.to_string(),
            reason: e.to_string(),
        })?;

    Ok(socket)
}

/// Configured bind address, or the unspecified address of the remote's family
/// when the two families disagree
fn bind_ip(config: &NetworkConfig, remote: SocketAddr) -> IpAddr {
    match config.bind_address.parse::<IpAddr>() {
        Ok(ip) if ip.is_ipv4() == remote.is_ipv4() => ip,
        Ok(ip) => {
            tracing::debug!(
                "Bind address {} does not match endpoint family of {}, using unspecified",
                ip,
                remote
            );
            unspecified_for(remote)
        }
        Err(_) => {
            tracing::warn!("Invalid bind address {:?}, using unspecified", config.bind_address);
            unspecified_for(remote)
        }
    }
}

fn unspecified_for(remote: SocketAddr) -> IpAddr {
    if remote.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}

/// Configure socket options
fn configure_socket(socket: &Socket, config: &NetworkConfig) -> Result<(), NetworkError> {
    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    }

    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set send buffer: {}", e)))?;

    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set recv buffer: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_creation() {
        let config = NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            ..Default::default()
        };

        let socket = create_socket(&config, "127.0.0.1:9".parse().unwrap());
        assert!(socket.is_ok());
    }

    #[test]
    fn test_bind_ip_follows_remote_family() {
        let config = NetworkConfig::default();
        let v6: SocketAddr = "[::1]:9".parse().unwrap();
        assert_eq!(bind_ip(&config, v6), IpAddr::V6(Ipv6Addr::UNSPECIFIED));

        let v4: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(bind_ip(&config, v4), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[tokio::test]
    async fn test_connected_socket() {
        let peer = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = peer.local_addr().unwrap();

        let socket = create_connected_socket(&NetworkConfig::default(), remote)
            .await
            .unwrap();
        assert_eq!(socket.peer_addr().unwrap(), remote);

        socket.send(b"ping").await.unwrap();
        let mut buf = [0u8; 8];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.port(), socket.local_addr().unwrap().port());
    }
}
