//! Runs the monitoring agent.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ovm_agent::{
    AgentConfig, DEFAULT_RECONNECT_DELAY, Daemon, DaemonOptions, Error, PipelineSettings, Result,
    STOP_SETTLE_DELAY,
};
use ovm_discovery_ironic::{IronicInventory, IronicInventoryOptions};
use ovm_election::{ElectionService, generate_member_id};
use ovm_election_memory::MemoryElection;
use ovm_election_nats::{NatsElection, NatsElectionConfig};
use ovm_eventbus::{DEFAULT_SETTLE_DELAY, DriverRegistry, EventBus, EventBusOptions};
use ovm_keystone::{KeystoneClient, KeystoneOptions};
use ovm_monasca::MonascaClient;
use ovm_oneview::{OneViewClient, OneViewOptions};
use ovm_scmb::{BrokerEndpoint, PushChannel};
use ovm_scmb_amqp::AmqpPushChannel;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

static ELECTION_BUCKET_PREFIX: &str = "oneview_monasca_election";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level, raised to debug when the configuration asks for it
    #[arg(long, env = "OVM_LOG_LEVEL", default_value_t = Level::INFO)]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent until interrupted
    Run {
        /// Path to the configuration file
        #[arg(long, default_value = "/etc/oneview-monasca/agent.toml")]
        config: PathBuf,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to the configuration file
        #[arg(long, default_value = "/etc/oneview-monasca/agent.toml")]
        config: PathBuf,

        /// Also log in to the appliance and the identity service
        #[arg(long)]
        online: bool,
    },

    /// Write a starting configuration file with every setting at its default
    Genconfig {
        /// Destination file, standard output when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { config } => {
            let config = load(&config, args.log_level)?;
            run(config).await
        }
        Command::CheckConfig { config, online } => {
            let config = load(&config, args.log_level)?;
            info!(drivers = ?config.agent.drivers, "configuration is valid");

            if online {
                oneview_client(&config)?.check_credentials().await?;
                info!(host = %config.oneview.host, "appliance credentials accepted");

                identity_client(&config, config.openstack.insecure)?
                    .session()
                    .await?;
                info!(auth_url = %config.openstack.auth_url, "identity credentials accepted");
            }

            Ok(())
        }
        Command::Genconfig { output } => genconfig(output.as_deref()),
    }
}

fn genconfig(output: Option<&Path>) -> Result<()> {
    let rendered = AgentConfig::sample()?.to_toml()?;

    match output {
        Some(path) => std::fs::write(path, rendered).map_err(|source| Error::WriteConfig {
            path: path.to_path_buf(),
            source,
        }),
        None => {
            print!("{rendered}");
            Ok(())
        }
    }
}

fn load(path: &Path, level: Level) -> Result<AgentConfig> {
    let config = AgentConfig::from_file(path)?;

    let level = if config.agent.debug {
        Level::DEBUG
    } else {
        level
    };
    tracing::subscriber::set_global_default(FmtSubscriber::builder().with_max_level(level).finish())?;

    Ok(config)
}

fn oneview_client(config: &AgentConfig) -> Result<OneViewClient> {
    let oneview = &config.oneview;

    Ok(OneViewClient::new(OneViewOptions {
        host: oneview.host.clone(),
        username: oneview.username.clone(),
        password: oneview.password.clone(),
        allow_insecure_connections: oneview.allow_insecure_connections,
        tls_cacert_file: oneview.tls_cacert_file.clone(),
        max_attempts: config.agent.auth_retry_limit,
        retry_delay: ovm_oneview::DEFAULT_RETRY_DELAY,
        certificate_dir: config.agent.scmb_certificate_dir.clone(),
    })?)
}

fn identity_client(config: &AgentConfig, insecure: bool) -> Result<KeystoneClient> {
    let openstack = &config.openstack;

    Ok(KeystoneClient::new(KeystoneOptions {
        auth_url: openstack.auth_url.clone(),
        username: openstack.auth_user.clone(),
        password: openstack.auth_password.clone(),
        project_name: openstack.auth_tenant_name.clone(),
        insecure,
    })?)
}

fn driver_registry(config: &AgentConfig, hardware: &Arc<OneViewClient>) -> Result<DriverRegistry> {
    let retry_interval = config.agent.retry_interval();
    let mut registry = DriverRegistry::new();

    if let Some(serverlist) = &config.serverlist {
        let lookup = hardware.clone();
        let mac_file_path = serverlist.mac_file_path.clone();
        registry.register(ovm_discovery_serverlist::DRIVER_NAME, move || {
            Ok(ovm_discovery_serverlist::driver(
                lookup.clone(),
                mac_file_path.clone(),
                retry_interval,
            ))
        });
    }

    let inventory = Arc::new(IronicInventory::new(IronicInventoryOptions {
        identity: Arc::new(identity_client(config, config.ironic.insecure)?),
        api_version: config.ironic.api_version.clone(),
        max_attempts: config.agent.auth_retry_limit,
        retry_delay: ovm_oneview::DEFAULT_RETRY_DELAY,
    }));
    registry.register(ovm_discovery_ironic::DRIVER_NAME, move || {
        Ok(ovm_discovery_ironic::driver(inventory.clone(), retry_interval))
    });

    Ok(registry)
}

/// Appliance address without scheme, port or path.
fn broker_host(host: &str) -> String {
    let host = host
        .split_once("://")
        .map_or(host, |(_, rest)| rest);
    let host = host.split('/').next().unwrap_or(host);

    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(name, _)| name)
        .to_string()
}

async fn run(config: AgentConfig) -> Result<()> {
    let hardware = Arc::new(oneview_client(&config)?);
    let platform = Arc::new(MonascaClient::new(Arc::new(identity_client(
        &config,
        config.openstack.insecure,
    )?)));

    let bus = Arc::new(EventBus::new(EventBusOptions {
        drivers: config.agent.drivers.clone(),
        registry: driver_registry(&config, &hardware)?,
        settle_delay: DEFAULT_SETTLE_DELAY,
    }));

    let settings = PipelineSettings {
        batch_interval: config.agent.batch_interval(),
        refresh_interval: config.agent.refresh_interval(),
        max_retry_attempts: config.agent.auth_retry_limit,
        reconnect_delay: DEFAULT_RECONNECT_DELAY,
        broker: BrokerEndpoint::for_host(broker_host(&config.oneview.host)),
        stop_settle_delay: STOP_SETTLE_DELAY,
    };

    let push_channel: Arc<dyn PushChannel> = Arc::new(AmqpPushChannel::new());

    let Some(coordination) = &config.coordination else {
        return supervise(DaemonOptions::<_, _, MemoryElection> {
            bus,
            hardware,
            platform,
            push_channel: Some(push_channel),
            election: None,
            group: String::new(),
            settings,
        })
        .await;
    };

    match async_nats::connect(coordination.nats_url.as_str()).await {
        Ok(client) => {
            let election = NatsElection::new(NatsElectionConfig {
                bucket_prefix: ELECTION_BUCKET_PREFIX.to_string(),
                client,
                member_id: generate_member_id(),
                member_ttl: Duration::from_secs(10),
                num_replicas: 1,
                persist: false,
                stand_down_cooldown: None,
                operation_timeout: None,
                max_retries: None,
                retry_base_delay: None,
                retry_max_delay: None,
            });

            supervise(DaemonOptions {
                bus,
                hardware,
                platform,
                push_channel: Some(push_channel),
                election: Some(Arc::new(election)),
                group: coordination.group_name.clone(),
                settings,
            })
            .await
        }
        Err(e) => {
            warn!(error = %e, url = %coordination.nats_url, "the agent is running without active/passive fault tolerance");

            supervise(DaemonOptions::<_, _, MemoryElection> {
                bus,
                hardware,
                platform,
                push_channel: Some(push_channel),
                election: None,
                group: String::new(),
                settings,
            })
            .await
        }
    }
}

async fn supervise<E>(options: DaemonOptions<OneViewClient, MonascaClient, E>) -> Result<()>
where
    E: ElectionService,
{
    let daemon = Arc::new(Daemon::new(options));
    daemon.start().await?;

    wait_for_signal().await?;
    info!("shutting down");
    daemon.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).map_err(Error::Signal)?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(Error::Signal),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.map_err(Error::Signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_host() {
        assert_eq!(broker_host("oneview.example.com"), "oneview.example.com");
        assert_eq!(broker_host("https://10.0.0.5"), "10.0.0.5");
        assert_eq!(broker_host("https://oneview:8443/"), "oneview");
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["ovm-agent", "check-config", "--online"]).unwrap();

        assert_eq!(args.log_level, Level::INFO);
        assert!(matches!(args.command, Command::CheckConfig { online: true, .. }));
    }

    #[test]
    fn test_genconfig_output_passes_check_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        let args = Args::try_parse_from([
            "ovm-agent",
            "genconfig",
            "--output",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let Command::Genconfig { output } = args.command else {
            panic!("expected the genconfig command");
        };

        genconfig(output.as_deref()).unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.oneview.host, "oneview.example.com");
        assert!(config.coordination.is_some());
    }
}
