use crate::discovery;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Device selection arguments. At most one may be given; the default is
/// casting to the first device discovered.
#[derive(clap::Args, Clone, Debug)]
#[group(id = "target_args", multiple = false)]
pub struct TargetArgs {
    /// Cast to the first device whose friendly name contains this string
    /// (case-insensitive).
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Cast to the device with exactly this id (the `id` mDNS TXT record).
    #[arg(long, value_name = "DEVICE_ID")]
    pub id: Option<String>,

    /// Cast device IP address (IPv4 or IPv6), skipping discovery.
    ///
    /// Uses default TCP port 8009. Use `--addr` to override the TCP port.
    #[arg(long, value_name = "DEVICE_IP")]
    pub ip: Option<IpAddr>,

    /// Cast device IP address and TCP port, skipping discovery.
    #[arg(long, value_name = "DEVICE_IP:PORT")]
    pub addr: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
pub enum Target {
    Discovered(discovery::Target),
    SocketAddr(SocketAddr),
}

impl TargetArgs {
    /// Convert to `Target` enum from specified clap args.
    pub fn to_target(&self) -> Target {
        if let Some(sa) = self.addr {
            Target::SocketAddr(sa)
        } else if let Some(ip) = self.ip {
            Target::SocketAddr(SocketAddr::from((ip, crate::client::DEFAULT_PORT)))
        } else if let Some(ref name) = self.name {
            Target::Discovered(discovery::Target::NameContains(name.clone()))
        } else if let Some(ref id) = self.id {
            Target::Discovered(discovery::Target::Id(id.clone()))
        } else {
            Target::Discovered(discovery::Target::First)
        }
    }

    pub async fn resolve_to_socket_addr(&self, discovery_timeout: Duration)
    -> crate::Result<SocketAddr>
    {
        Ok(match self.to_target() {
            Target::SocketAddr(sa) => sa,
            Target::Discovered(target) =>
                discovery::select_first(discovery_timeout, &target).await?.addr,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_target_is_first_device() {
        let args = TargetArgs { name: None, id: None, ip: None, addr: None };
        assert!(matches!(args.to_target(),
                         Target::Discovered(discovery::Target::First)));
    }

    #[test]
    fn ip_uses_default_port() {
        let args = TargetArgs {
            name: None,
            id: None,
            ip: Some("192.168.1.40".parse().unwrap()),
            addr: None,
        };
        let Target::SocketAddr(sa) = args.to_target() else {
            panic!("expected socket addr target");
        };
        assert_eq!(sa, "192.168.1.40:8009".parse().unwrap());
    }
}
