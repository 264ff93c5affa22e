//! Configuration for helmd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use fleetsync_core::plugin::{inventory_from, PluginInventory};
use fleetsync_core::PluginDescriptor;
use fleetsync_net::ocsp::OcspPolicy;
use fleetsync_net::tls::TlsMode;

/// helmd - Fleetsync Control-Plane Daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "helmd")]
#[command(about = "Fleetsync configuration control-plane daemon")]
pub struct Config {
    /// Listen address for data-plane connections
    #[arg(short, long, default_value = "0.0.0.0:8005")]
    pub listen: SocketAddr,

    /// Data directory for peer status records
    #[arg(short, long, default_value = "./data/helmd")]
    pub data_dir: PathBuf,

    /// Path to the JSON configuration export
    #[arg(long, env = "FLEETSYNC_EXPORT")]
    pub export: PathBuf,

    /// Cluster mTLS mode (shared or pki)
    #[arg(long, default_value = "shared")]
    pub cluster_mtls: String,

    /// Cluster certificate (PEM)
    #[arg(long)]
    pub cluster_cert: PathBuf,

    /// Cluster certificate key (PEM)
    #[arg(long)]
    pub cluster_cert_key: PathBuf,

    /// Cluster CA certificate (PEM; required in pki mode)
    #[arg(long)]
    pub cluster_ca_cert: Option<PathBuf>,

    /// OCSP revocation policy in pki mode (on, off, or optional)
    #[arg(long, default_value = "off")]
    pub cluster_ocsp: String,

    /// Advertised control-plane version
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    pub node_version: String,

    /// Installed plugins (name or name@version, comma-separated)
    #[arg(long = "plugin", value_delimiter = ',')]
    pub plugins: Vec<String>,

    /// Seconds before disconnected data-plane records are purged
    #[arg(long, default_value = "1209600")]
    pub cluster_data_plane_purge_delay: u64,

    /// Minimum seconds between configuration pushes
    #[arg(long, default_value = "5")]
    pub db_update_frequency: u64,

    /// Expected heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    pub ping_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mode = self.tls_mode()?;
        self.ocsp_policy()?;
        self.inventory()?;
        if mode == TlsMode::Pki && self.cluster_ca_cert.is_none() {
            anyhow::bail!("pki mode requires --cluster-ca-cert");
        }
        if self.ping_interval == 0 {
            anyhow::bail!("ping interval cannot be zero");
        }
        Ok(())
    }

    pub fn tls_mode(&self) -> anyhow::Result<TlsMode> {
        Ok(self.cluster_mtls.parse()?)
    }

    pub fn ocsp_policy(&self) -> anyhow::Result<OcspPolicy> {
        Ok(self.cluster_ocsp.parse()?)
    }

    /// Installed-plugin inventory from the `--plugin` entries.
    pub fn inventory(&self) -> anyhow::Result<PluginInventory> {
        let descriptors = self
            .plugins
            .iter()
            .map(|spec| PluginDescriptor::parse_spec(spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(inventory_from(descriptors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "helmd",
            "--export",
            "/tmp/export.json",
            "--cluster-cert",
            "/tmp/cluster.pem",
            "--cluster-cert-key",
            "/tmp/cluster.key",
        ]
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(base_args());
        assert_eq!(config.cluster_mtls, "shared");
        assert_eq!(config.cluster_ocsp, "off");
        assert_eq!(config.cluster_data_plane_purge_delay, 1209600);
        assert_eq!(config.db_update_frequency, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pki_requires_ca() {
        let mut args = base_args();
        args.extend(["--cluster-mtls", "pki"]);
        let config = Config::parse_from(args);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_plugin_inventory_parsing() {
        let mut args = base_args();
        args.extend(["--plugin", "key-auth@3.0.0,rate-limiting"]);
        let config = Config::parse_from(args);
        let inventory = config.inventory().unwrap();
        assert_eq!(inventory.len(), 2);
        assert!(inventory["rate-limiting"].version.is_none());

        let mut args = base_args();
        args.extend(["--plugin", "@bad"]);
        assert!(Config::parse_from(args).validate().is_err());
    }
}
