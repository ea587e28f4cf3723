//! Public address resolution.
//!
//! The server resolves one public IP at startup and uses it as both the bind
//! address and the advertised address of every relay listener. Failing to
//! resolve is not fatal: the server carries on with no public address and
//! relay listeners bind the unspecified address.

use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Source of the server's public IP.
pub trait AddressResolver: Send + Sync {
    /// Returns the public IP, or `None` if it cannot be determined.
    fn resolve(&self) -> Option<IpAddr>;
}

/// Resolver returning a fixed, configured address.
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver(pub Option<IpAddr>);

impl AddressResolver for StaticResolver {
    fn resolve(&self) -> Option<IpAddr> {
        self.0
    }
}

/// Resolver that picks the address of the interface carrying the default
/// route.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
#[derive(Debug, Clone, Copy)]
pub struct LocalInterfaceResolver {
    route_target: SocketAddr,
}

impl Default for LocalInterfaceResolver {
    fn default() -> Self {
        Self {
            route_target: SocketAddr::from(([192, 0, 2, 1], 9)),
        }
    }
}

impl LocalInterfaceResolver {
    /// Selects the route toward `route_target` instead of the default.
    #[must_use]
    pub const fn with_route_target(route_target: SocketAddr) -> Self {
        Self { route_target }
    }
}

impl AddressResolver for LocalInterfaceResolver {
    fn resolve(&self) -> Option<IpAddr> {
        let bind: SocketAddr = if self.route_target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let discovered = UdpSocket::bind(bind)
            .and_then(|socket| {
                socket.connect(self.route_target)?;
                socket.local_addr()
            })
            .map(|addr| addr.ip());

        match discovered {
            Ok(ip) if !ip.is_unspecified() => Some(ip),
            Ok(_) => {
                tracing::warn!(route_target = %self.route_target, "no routable local address found");
                None
            }
            Err(e) => {
                tracing::warn!(route_target = %self.route_target, error = %e, "public address discovery failed");
                None
            }
        }
    }
}
