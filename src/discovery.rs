//! mDNS discovery of cast devices on the local network.

use crate::{util::named, Error};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::{
    collections::HashSet,
    net::SocketAddr,
    time::Duration,
};

pub const SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// A cast device resolved from its mDNS advertisement.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    /// Stable device id from the `id` TXT record, or a synthesised
    /// fallback when the record is missing.
    pub id: String,

    /// Friendly name from the `fn` TXT record.
    pub name: String,

    /// Model string from the `md` TXT record, possibly empty.
    pub model: String,

    pub addr: SocketAddr,
}

/// Which advertised device to cast to.
#[derive(Clone, Debug, Default)]
pub enum Target {
    /// First device to answer, in arrival order.
    #[default]
    First,

    /// First device whose friendly name contains this string,
    /// case-insensitively.
    NameContains(String),

    /// Exact match on the device id.
    Id(String),
}

impl Target {
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        match self {
            Target::First => true,
            Target::NameContains(needle) =>
                device.name.to_lowercase().contains(&needle.to_lowercase()),
            Target::Id(id) => &device.id == id,
        }
    }
}

/// An in-progress browse of the local network.
///
/// Yields each matching device once; the same device re-announcing is
/// deduplicated by id. Ends when `timeout` expires.
pub struct Discovery {
    daemon: Option<ServiceDaemon>,
    browse_rx: mdns_sd::Receiver<ServiceEvent>,
    deadline: tokio::time::Instant,
    seen_ids: HashSet<String>,
}

/// Starts browsing for cast devices.
///
/// Failure here means the mDNS transport itself could not be opened,
/// which no amount of waiting will fix.
pub fn discover(timeout: Duration) -> crate::Result<Discovery> {
    let daemon = ServiceDaemon::new()
        .map_err(|err| Error::NetworkUnavailable(
            anyhow::format_err!("mDNS daemon: {err}")))?;

    let browse_rx = daemon.browse(SERVICE_TYPE)
        .map_err(|err| {
            let _ = daemon.shutdown();
            Error::NetworkUnavailable(
                anyhow::format_err!("mDNS browse: {err}"))
        })?;

    Ok(Discovery {
        daemon: Some(daemon),
        browse_rx,
        deadline: tokio::time::Instant::now() + timeout,
        seen_ids: HashSet::new(),
    })
}

/// Browses until a device matching `target` answers.
///
/// Ties between devices answering concurrently go to whichever
/// advertisement arrived first.
#[named]
pub async fn select_first(timeout: Duration, target: &Target)
-> crate::Result<DeviceDescriptor>
{
    const FUNCTION_PATH: &str = function_path!();

    let mut discovery = discover(timeout)?;

    while let Some(device) = discovery.next().await {
        if target.matches(&device) {
            tracing::info!(target: FUNCTION_PATH,
                           device_name = device.name,
                           device_id = device.id,
                           device_addr = %device.addr,
                           "selected cast device");
            return Ok(device);
        }

        tracing::debug!(target: FUNCTION_PATH,
                        device_name = device.name,
                        device_id = device.id,
                        ?target,
                        "device did not match target");
    }

    Err(Error::NotFound { timeout })
}

impl Discovery {
    /// Next newly resolved device, or None once the window closes.
    #[named]
    pub async fn next(&mut self) -> Option<DeviceDescriptor> {
        const METHOD_PATH: &str = method_path!("Discovery");

        loop {
            let event = match tokio::time::timeout_at(
                self.deadline, self.browse_rx.recv_async()).await
            {
                // Deadline reached.
                Err(_elapsed) => return None,

                // Browse channel closed underneath us.
                Ok(Err(err)) => {
                    tracing::warn!(target: METHOD_PATH,
                                   ?err,
                                   "browse channel closed");
                    return None;
                },

                Ok(Ok(event)) => event,
            };

            let ServiceEvent::ServiceResolved(service) = event else {
                continue;
            };

            let Some(device) = descriptor_from_resolved(&service) else {
                tracing::debug!(target: METHOD_PATH,
                                fullname = service.get_fullname(),
                                "resolved service with no usable address");
                continue;
            };

            if !self.seen_ids.insert(device.id.clone()) {
                continue;
            }

            tracing::debug!(target: METHOD_PATH,
                            device_name = device.name,
                            device_id = device.id,
                            device_addr = %device.addr,
                            "resolved cast device");

            return Some(device);
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Err(err) = daemon.stop_browse(SERVICE_TYPE) {
                tracing::debug!(?err, "failed to stop mDNS browse cleanly");
            }
            let _ = daemon.shutdown();
        }
    }
}

fn descriptor_from_resolved(service: &mdns_sd::ServiceInfo)
-> Option<DeviceDescriptor>
{
    // Prefer IPv4: the device fetches media back from us over a URL we
    // build from a plain local address.
    let mut v4_addresses: Vec<_> = service.get_addresses_v4().iter().copied().collect();
    v4_addresses.sort();
    let ip: std::net::Ipv4Addr = v4_addresses.first()
        .map(ToString::to_string)?
        .parse()
        .ok()?;

    let port = service.get_port();
    let fallback_name = instance_name_from_fullname(service.get_fullname());

    let name = service
        .get_property_val_str("fn")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or(fallback_name);

    let model = service
        .get_property_val_str("md")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_default();

    let id = service
        .get_property_val_str("id")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| service.get_fullname().to_string());

    Some(DeviceDescriptor {
        id,
        name,
        model,
        addr: SocketAddr::from((ip, port)),
    })
}

fn instance_name_from_fullname(fullname: &str) -> String {
    fullname
        .trim()
        .strip_suffix(SERVICE_TYPE)
        .map(|name| name.trim().trim_matches('.'))
        .filter(|value| !value.is_empty())
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    fn device(id: &str, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            model: String::new(),
            addr: "192.168.1.40:8009".parse().unwrap(),
        }
    }

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(
            instance_name_from_fullname(
                "Living Room TV._googlecast._tcp.local."),
            "Living Room TV");

        // Degenerate: nothing left once the suffix and dots go, so the
        // raw fullname passes through.
        assert_eq!(
            instance_name_from_fullname("._googlecast._tcp.local."),
            "._googlecast._tcp.local.");

        // Unrelated names pass through.
        assert_eq!(instance_name_from_fullname("weird"), "weird");
    }

    #[test]
    fn target_first_matches_anything() {
        assert!(Target::First.matches(&device("a", "Whatever")));
    }

    #[test]
    fn target_name_contains_is_case_insensitive() {
        let t = Target::NameContains("living".to_string());
        assert!(t.matches(&device("a", "Living Room TV")));
        assert!(!t.matches(&device("a", "Kitchen display")));
    }

    #[test]
    fn target_id_is_exact() {
        let t = Target::Id("abc123".to_string());
        assert!(t.matches(&device("abc123", "x")));
        assert!(!t.matches(&device("abc1234", "x")));
    }

    // A zero timeout puts the deadline in the past, so `next` must
    // return immediately without a network round trip.
    #[tokio::test]
    async fn zero_timeout_discovery_yields_nothing() {
        // Opening the daemon can fail in minimal environments; only the
        // deadline behaviour is under test here.
        let Ok(mut discovery) = discover(Duration::ZERO) else {
            return;
        };

        assert!(discovery.next().await.is_none());
    }
}
