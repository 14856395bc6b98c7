//! Bind-address policy for the bridge container.
//!
//! Local installs keep the bridge on loopback at all times. Remote/headless
//! installs temporarily publish on all interfaces so the pairing code can be
//! reached from another machine; that exposure is a window, not a state —
//! [`secure`] closes it by restarting the container loopback-only once a
//! device is linked.

use anyhow::Result;

use crate::container::{ContainerManager, ContainerSpec};

/// Host address the container's API port is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindAddress {
    /// Reachable from the local host only.
    Loopback,
    /// Reachable from any interface. Temporary, for remote/headless pairing.
    AllInterfaces,
}

impl BindAddress {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindAddress::Loopback => "127.0.0.1",
            BindAddress::AllInterfaces => "0.0.0.0",
        }
    }

    /// True when the address is reachable from other machines.
    pub fn is_exposed(&self) -> bool {
        matches!(self, BindAddress::AllInterfaces)
    }
}

impl std::fmt::Display for BindAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Choose the bind address for a linking session.
pub fn decide(remote: bool) -> BindAddress {
    if remote {
        BindAddress::AllInterfaces
    } else {
        BindAddress::Loopback
    }
}

/// Host other machines should use to reach an exposed bridge: the machine's
/// LAN address, falling back to loopback when no interface can be determined.
pub fn advertised_host() -> String {
    match local_ip_address::local_ip() {
        Ok(addr) => addr.to_string(),
        Err(_) => BindAddress::Loopback.as_str().to_string(),
    }
}

/// Rewrite a loopback-hosted URL so it is reachable from another machine.
///
/// The bridge API is always polled over loopback; only the URL shown to the
/// operator needs the advertised host.
pub fn advertise_url(url: &str, host: &str) -> String {
    for loopback in ["127.0.0.1", "localhost"] {
        if url.contains(loopback) {
            return url.replacen(loopback, host, 1);
        }
    }
    url.to_string()
}

/// Re-bind an exposed bridge container to loopback, keeping the credential
/// volume unchanged and switching to the post-link operating mode.
///
/// The container is stopped and recreated; credentials live on the mounted
/// volume, so the link survives the restart.
pub fn secure(manager: &ContainerManager<'_>, spec: &ContainerSpec) -> Result<()> {
    let secured = ContainerSpec {
        bind: BindAddress::Loopback,
        mode: spec.post_link_mode,
        ..spec.clone()
    };
    manager.start(&secured)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_sessions_bind_loopback() {
        assert_eq!(decide(false), BindAddress::Loopback);
        assert!(!decide(false).is_exposed());
    }

    #[test]
    fn remote_sessions_bind_all_interfaces() {
        assert_eq!(decide(true), BindAddress::AllInterfaces);
        assert!(decide(true).is_exposed());
    }

    #[test]
    fn addresses_render_as_ips() {
        assert_eq!(BindAddress::Loopback.to_string(), "127.0.0.1");
        assert_eq!(BindAddress::AllInterfaces.to_string(), "0.0.0.0");
    }

    #[test]
    fn advertised_url_replaces_loopback_host() {
        assert_eq!(
            advertise_url("http://127.0.0.1:8080/v1/qrcodelink?device_name=pc", "192.168.1.50"),
            "http://192.168.1.50:8080/v1/qrcodelink?device_name=pc"
        );
        assert_eq!(
            advertise_url("http://localhost:8080/v1/accounts", "10.0.0.7"),
            "http://10.0.0.7:8080/v1/accounts"
        );
    }

    #[test]
    fn non_loopback_urls_are_left_alone() {
        let url = "http://bridge.internal:8080/v1/accounts";
        assert_eq!(advertise_url(url, "192.168.1.50"), url);
    }
}
