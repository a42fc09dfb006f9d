use crate::error::{Result, SyncError};

/// Asks the local gateway to forward the server port. Mapping is best effort:
/// the server logs a failure and keeps running.
pub trait PortMapper {
    fn map_port(&mut self, port: u16) -> Result<()>;

    fn unmap_port(&mut self, _port: u16) {}
}

/// No gateway support compiled in. Players outside the LAN need the port
/// forwarded by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualPortForwarding;

impl PortMapper for ManualPortForwarding {
    fn map_port(&mut self, _port: u16) -> Result<()> {
        Err(SyncError::PortMapping(
            "built without the `upnp` feature".to_string(),
        ))
    }
}

#[cfg(feature = "upnp")]
pub use upnp::UpnpPortMapper;

#[cfg(feature = "upnp")]
pub fn default_port_mapper() -> Box<dyn PortMapper> {
    Box::new(UpnpPortMapper::default())
}

#[cfg(not(feature = "upnp"))]
pub fn default_port_mapper() -> Box<dyn PortMapper> {
    Box::new(ManualPortForwarding)
}

#[cfg(feature = "upnp")]
mod upnp {
    use super::PortMapper;
    use crate::error::{Result, SyncError};
    use igd_next::{search_gateway, Gateway, PortMappingProtocol, SearchOptions};
    use std::net::{IpAddr, SocketAddr, UdpSocket};
    use std::time::Duration;

    const DESCRIPTION: &str = "worldsync server";

    /// Gateway discovery gives up after this long.
    pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

    pub struct UpnpPortMapper {
        timeout: Duration,
        lease_secs: u32,
        gateway: Option<Gateway>,
    }

    impl Default for UpnpPortMapper {
        fn default() -> Self {
            Self {
                timeout: DISCOVERY_TIMEOUT,
                lease_secs: 0,
                gateway: None,
            }
        }
    }

    impl UpnpPortMapper {
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        /// Lease length in seconds, 0 asks for a mapping without expiry.
        pub fn with_lease(mut self, seconds: u32) -> Self {
            self.lease_secs = seconds;
            self
        }
    }

    /// Address of the interface that routes to `gateway`.
    fn local_ip_towards(gateway: SocketAddr) -> Result<IpAddr> {
        let bind: SocketAddr = match gateway {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => ([0u16; 8], 0).into(),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(gateway)?;
        Ok(socket.local_addr()?.ip())
    }

    impl PortMapper for UpnpPortMapper {
        fn map_port(&mut self, port: u16) -> Result<()> {
            let options = SearchOptions {
                timeout: Some(self.timeout),
                ..Default::default()
            };
            let gateway = search_gateway(options).map_err(|e| SyncError::PortMapping(e.to_string()))?;
            let local = SocketAddr::new(local_ip_towards(gateway.addr)?, port);

            gateway
                .add_port(PortMappingProtocol::TCP, port, local, self.lease_secs, DESCRIPTION)
                .map_err(|e| SyncError::PortMapping(e.to_string()))?;

            tracing::debug!("Gateway {} forwards TCP {} to {}", gateway.addr, port, local);
            self.gateway = Some(gateway);
            Ok(())
        }

        fn unmap_port(&mut self, port: u16) {
            let Some(gateway) = self.gateway.take() else {
                return;
            };
            if let Err(e) = gateway.remove_port(PortMappingProtocol::TCP, port) {
                tracing::debug!("Removing port mapping {} failed: {}", port, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every call; fails mapping when `fail` is set.
    #[derive(Clone, Default)]
    pub struct RecordingMapper {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub fail: bool,
    }

    impl RecordingMapper {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PortMapper for RecordingMapper {
        fn map_port(&mut self, port: u16) -> Result<()> {
            self.calls.lock().unwrap().push(format!("map {}", port));
            if self.fail {
                Err(SyncError::PortMapping("no gateway found".to_string()))
            } else {
                Ok(())
            }
        }

        fn unmap_port(&mut self, port: u16) {
            self.calls.lock().unwrap().push(format!("unmap {}", port));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_forwarding_reports_failure() {
        let mut mapper = ManualPortForwarding;
        assert!(matches!(mapper.map_port(4230), Err(SyncError::PortMapping(_))));
        mapper.unmap_port(4230);
    }
}
