use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use powerdns_exporter::{
    collector::{self, Collector},
    config::{self, Config, Overrides},
    fetch::{self, Fetcher},
    httpd::{self, Httpd},
    registry::{Registry, ServerFlavor},
    telemetry,
};
use tokio::{runtime::Builder, signal, time};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use url::Url;

/// Environment variable holding YAML config contents, used instead of
/// `--config-path` when set.
const CONFIG_ENV: &str = "POWERDNS_EXPORTER_CONFIG";
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("Could not reach the PowerDNS API: {0}")]
    Fetch(#[from] fetch::Error),
    #[error("Could not set up instruments: {0}")]
    Collector(#[from] collector::Error),
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] telemetry::Error),
    #[error("HTTP server error: {0}")]
    Httpd(#[from] httpd::Error),
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// path on disk to an optional YAML configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// address to listen on for the metrics endpoint and landing page
    #[clap(long)]
    listen_address: Option<SocketAddr>,
    /// path under which to expose metrics
    #[clap(long)]
    metric_path: Option<String>,
    /// base URL of the PowerDNS API
    #[clap(long)]
    api_url: Option<Url>,
    /// PowerDNS API key
    #[clap(long)]
    api_key: Option<String>,
    /// timeout of each PowerDNS API request, in seconds
    #[clap(long)]
    api_timeout_seconds: Option<u64>,
    /// number of concurrent HTTP connections to accept
    #[clap(long)]
    concurrent_requests_max: Option<usize>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen_address: self.listen_address,
            metric_path: self.metric_path.clone(),
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            api_timeout_seconds: self.api_timeout_seconds,
            concurrent_requests_max: self.concurrent_requests_max,
        }
    }
}

fn get_config(cli: &Cli) -> Result<Config, Error> {
    let config = if let Ok(contents) = env::var(CONFIG_ENV) {
        debug!("Using config from env var '{CONFIG_ENV}'");
        Config::from_yaml(&contents)?
    } else if let Some(path) = &cli.config_path {
        debug!("Attempting to open configuration file at: {}", path.display());
        Config::load(path)?
    } else {
        Config::default()
    };
    let config = config.apply(cli.overrides()).map_err(|err| {
        error!("Configuration validation failed: {err}");
        err
    })?;
    Ok(config)
}

async fn inner_main(config: Config) -> Result<(), Error> {
    let handle = telemetry::install()?;
    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(UPKEEP_INTERVAL);
        loop {
            interval.tick().await;
            upkeep_handle.run_upkeep();
        }
    });

    let fetcher = Fetcher::new(
        config.api_url.clone(),
        config.api_key.clone(),
        config.api_timeout(),
    )?;
    let info = fetcher.fetch_server_info().await.map_err(|err| {
        error!(
            "Could not fetch PowerDNS server info from {}: {err}",
            fetcher.base_url()
        );
        err
    })?;
    info!(
        "Found PowerDNS {} {} ({})",
        info.daemon_type, info.version, info.id
    );

    let flavor = ServerFlavor::from(info.daemon_type);
    let registry = Registry::for_flavor(&flavor);
    if registry.gauges.is_empty() && registry.counter_vecs.is_empty() {
        info!("No statistics are mapped for '{flavor}', exporting health metrics only");
    }
    let collector = Collector::new(fetcher, &flavor, registry)?;

    let httpd = Httpd::new(
        collector,
        config.metric_path,
        Some(handle),
        config.concurrent_requests_max,
    );
    httpd
        .run(config.listen_address, async {
            match signal::ctrl_c().await {
                Ok(()) => info!("received ctrl-c"),
                Err(err) => error!("Could not listen for ctrl-c: {err}"),
            }
        })
        .await?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting powerdns_exporter {version}.");

    let cli = Cli::parse();
    let config = get_config(&cli)?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    info!("Bye. :)");
    res
}
