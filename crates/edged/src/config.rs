//! Configuration for edged

use clap::Parser;
use std::path::PathBuf;
use uuid::Uuid;

use fleetsync_core::plugin::{inventory_from, PluginInventory};
use fleetsync_core::PluginDescriptor;
use fleetsync_net::tls::TlsMode;

/// edged - Fleetsync Data-Plane Daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "edged")]
#[command(about = "Fleetsync configuration data-plane daemon")]
pub struct Config {
    /// Control plane endpoint (host:port)
    #[arg(long, default_value = "127.0.0.1:8005")]
    pub cluster_control_plane: String,

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

    /// TLS server name override in pki mode
    #[arg(long)]
    pub cluster_server_name: Option<String>,

    /// State directory holding the configuration cache
    #[arg(long, default_value = "./data/edged")]
    pub prefix: PathBuf,

    /// Node identifier advertised to the control plane
    #[arg(long, default_value_t = Uuid::new_v4().to_string())]
    pub node_id: String,

    /// Node hostname advertised to the control plane
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    pub node_hostname: String,

    /// Advertised data-plane version
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    pub node_version: String,

    /// Installed plugins (name or name@version, comma-separated)
    #[arg(long = "plugin", value_delimiter = ',')]
    pub plugins: Vec<String>,

    /// Heartbeat interval in seconds
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
        let mode: TlsMode = self.cluster_mtls.parse()?;
        self.inventory()?;
        if mode == TlsMode::Pki && self.cluster_ca_cert.is_none() {
            anyhow::bail!("pki mode requires --cluster-ca-cert");
        }
        if !self.cluster_control_plane.contains(':') {
            anyhow::bail!("control plane endpoint must be host:port");
        }
        if self.ping_interval == 0 {
            anyhow::bail!("ping interval cannot be zero");
        }
        Ok(())
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
