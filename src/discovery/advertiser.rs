//! Bonjour TXT records and the mdns-sd advertiser

use mdns_sd::{Error as MdnsError, ServiceDaemon, ServiceInfo};
use thiserror::Error;

/// Service advertisement errors
#[derive(Debug, Error)]
pub enum AdvertiserError {
    /// mDNS daemon failure
    #[error("mDNS error: {0}")]
    Mdns(#[from] MdnsError),
}

/// The `_hap._tcp` service type.
const SERVICE_TYPE: &str = "_hap._tcp.local.";

/// The dynamic half of the TXT record (HAP Table 6-7).
///
/// `c#` and `sf` change at runtime; the rest is fixed at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecords {
    /// Configuration number (`c#`)
    pub config_number: u32,
    /// Model name (`md`)
    pub model: String,
    /// Accessory category code (`ci`)
    pub category: u8,
    /// Device ID in `XX:XX:...` form (`id`)
    pub device_id: String,
    /// Whether an admin controller is enrolled (`sf` = 0 when paired)
    pub paired: bool,
}

impl TxtRecords {
    /// Render to TXT key/value pairs.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("c#".into(), self.config_number.to_string()),
            ("md".into(), self.model.clone()),
            ("ci".into(), self.category.to_string()),
            ("id".into(), self.device_id.clone()),
            // Software authentication only.
            ("ff".into(), "0".into()),
            ("pv".into(), "1.1".into()),
            ("s#".into(), "1".into()),
            ("sf".into(), if self.paired { "0" } else { "1" }.into()),
        ]
    }
}

/// Advertises the accessory over mDNS and pushes TXT updates.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    instance: String,
    host: String,
    port: u16,
}

impl MdnsAdvertiser {
    /// Register the service and start answering queries.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot start or registration fails.
    pub fn start(name: &str, port: u16, txt: &TxtRecords) -> Result<Self, AdvertiserError> {
        let daemon = ServiceDaemon::new()?;
        let host = format!(
            "hap-{}.local.",
            txt.device_id.replace(':', "").to_lowercase()
        );

        let advertiser = Self {
            daemon,
            instance: name.to_string(),
            host,
            port,
        };
        advertiser.update(txt)?;

        tracing::info!(name, port, "advertising _hap._tcp service");
        Ok(advertiser)
    }

    /// Re-register with fresh TXT records (`c#` bump or `sf` toggle).
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn update(&self, txt: &TxtRecords) -> Result<(), AdvertiserError> {
        let pairs = txt.to_pairs();
        let properties: Vec<(&str, &str)> = pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.instance,
            &self.host,
            "",
            self.port,
            &properties[..],
        )?
        .enable_addr_auto();

        self.daemon.register(info)?;
        tracing::debug!(config_number = txt.config_number, paired = txt.paired, "TXT updated");
        Ok(())
    }

    /// Withdraw the advertisement.
    pub fn shutdown(self) {
        let fullname = format!("{}.{}", self.instance, SERVICE_TYPE);
        if let Ok(receiver) = self.daemon.unregister(&fullname) {
            let _ = receiver.recv_timeout(std::time::Duration::from_secs(1));
        }
        let _ = self.daemon.shutdown();
    }
}
