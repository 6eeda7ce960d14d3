//! Gardener discovery server binary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gardener_discovery_server::server::{self, Settings};
use gardener_discovery_server::utils;

/// Public discovery endpoint for shoot cluster OIDC metadata and trust material.
#[derive(Debug, Parser)]
#[command(name = "gardener-discovery-server", version, about, long_about = None)]
struct Args {
    /// File containing the x509 certificate for HTTPS.
    #[arg(long, value_name = "PATH")]
    tls_cert_file: PathBuf,

    /// File containing the x509 private key matching --tls-cert-file.
    #[arg(long, value_name = "PATH")]
    tls_private_key_file: PathBuf,

    /// The IP address that the server will listen on.
    /// If unspecified all interfaces will be used.
    #[arg(long, default_value = "")]
    address: String,

    /// The port that the server will listen on.
    #[arg(long, default_value_t = 10443)]
    port: u16,

    /// The period between reconciliations of cluster discovery information.
    #[arg(long, default_value = "10m", value_parser = utils::parse_duration)]
    resync_period: Duration,

    /// File containing the workload identity openid configuration.
    #[arg(long, value_name = "PATH", requires = "workload_identity_jwks_file")]
    workload_identity_openid_config_file: Option<PathBuf>,

    /// File containing the workload identity JWKS.
    #[arg(
        long,
        value_name = "PATH",
        requires = "workload_identity_openid_config_file"
    )]
    workload_identity_jwks_file: Option<PathBuf>,

    /// Path to a kubeconfig for the garden cluster.
    /// In-cluster configuration is used when unset.
    #[arg(long, env = "KUBECONFIG", value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    /// Human readable single line output.
    Plain,
    /// JSON structured output.
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Plain => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let args = Args::parse();
    init_tracing(args.log_format);

    if args.resync_period.is_zero() {
        anyhow::bail!("--resync-period must be positive");
    }

    let ip: IpAddr = if args.address.trim().is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        args.address
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid --address {:?}: {}", args.address, e))?
    };

    let settings = Settings {
        bind_addr: SocketAddr::new(ip, args.port),
        tls_cert_file: args.tls_cert_file,
        tls_key_file: args.tls_private_key_file,
        resync_period: args.resync_period,
        workload_identity_files: args
            .workload_identity_openid_config_file
            .zip(args.workload_identity_jwks_file),
        kubeconfig: args.kubeconfig,
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_addr = %settings.bind_addr,
        resync_period = ?settings.resync_period,
        workload_identity = settings.workload_identity_files.is_some(),
        "starting gardener discovery server"
    );

    server::run(settings).await?;
    Ok(())
}
