//! Binary entrypoint. Parses `DriverConfig`, wires `HypervisorGateway`,
//! `DiskProvisioner`, the configured `FilterEngine` back-end,
//! `InstanceDriver`, and `ResourceReporter` together, then runs the
//! observability server and periodic resource-report loop until signaled.
//!
//! Grounded on the teacher's `main.rs` shape: `color_eyre::install()` first,
//! `clap::Parser::parse()`, then a tracing-subscriber init keyed off
//! verbosity/pretty flags before anything else runs.

use clap::Parser;
use compute_driver::config::{DriverConfig, FirewallDriver};
use compute_driver::driver::InstanceDriver;
use compute_driver::error::Result;
use compute_driver::filter::{host_filter::HostFilterEngine, hypervisor_filter::HypervisorFilterEngine, FilterEngine};
use compute_driver::gateway::HypervisorGateway;
use compute_driver::model::{ComputeNodeReport, Instance, NetworkInfo, PowerState, SecurityGroup};
use compute_driver::observability::ObservabilityServer;
use compute_driver::resource_reporter::ResourceReporter;
use compute_driver::store::{HttpImageService, ImageService, InstanceStore};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn setup_logger(verbosity: u8, pretty: bool) -> Result<()> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("compute_driver={level}")));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if pretty {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let config = DriverConfig::parse();
    setup_logger(config.verbose, config.pretty)?;

    tokio::fs::create_dir_all(&config.instances_path).await?;

    let gateway = Arc::new(HypervisorGateway::new(config.connection_uri()));
    let store: Arc<dyn InstanceStore> = Arc::new(StandaloneStore::default());
    let image_service: Arc<dyn ImageService> = Arc::new(HttpImageService::new("http://localhost:9292/v1"));

    let disks = Arc::new(compute_driver::disk::DiskProvisioner::new(
        config.instances_path.clone(),
        config.use_cow_images,
        config.minimum_root_size,
        image_service,
    ));

    let filter: Arc<dyn FilterEngine> = match config.firewall_driver {
        FirewallDriver::HypervisorFilter => Arc::new(HypervisorFilterEngine::new(
            gateway.clone(),
            store.clone(),
            config.allow_project_net_traffic,
            config.use_ipv6,
        )),
        FirewallDriver::HostPacketFilter => Arc::new(HostFilterEngine::new(
            store.clone(),
            config.allow_project_net_traffic,
            config.use_ipv6,
        )),
    };

    let _driver = InstanceDriver::new(gateway.clone(), disks, filter, store.clone(), config.clone());

    let reporter = Arc::new(ResourceReporter::new(
        gateway.clone(),
        config.instances_path.clone(),
        format!("{:?}", config.libvirt_type).to_lowercase(),
        1,
    ));

    let observability = Arc::new(ObservabilityServer::new(config.observability_port)?);

    let server_handle = tokio::spawn(observability.clone().serve());
    let report_handle = tokio::spawn(report_loop(reporter, observability, store, config.resource_report_interval_secs));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => warn!(error = %e, "observability server exited with an error"),
                Err(e) => warn!(error = %e, "observability server task ended unexpectedly"),
                Ok(Ok(())) => {}
            }
        }
        result = report_handle => {
            if let Err(e) = result {
                warn!(error = %e, "resource report task ended unexpectedly");
            }
        }
    }

    Ok(())
}

async fn report_loop(
    reporter: Arc<ResourceReporter>,
    observability: Arc<ObservabilityServer>,
    store: Arc<dyn InstanceStore>,
    interval_secs: u64,
) {
    let mut ticks = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    let mut first = true;
    loop {
        ticks.tick().await;
        match reporter.report().await {
            Ok(report) => {
                observability.observe(&report);
                let host = hostname();
                let result = if first {
                    store.compute_node_create(&report).await
                } else {
                    store.compute_node_update(&host, &report).await
                };
                if let Err(e) = result {
                    warn!(error = %e, "failed to publish compute node report");
                }
                first = false;
            }
            Err(e) => warn!(error = %e, "resource report failed"),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}

/// Placeholder `InstanceStore` for running this driver standalone, outside
/// an orchestrator. `instance_get_all_by_host` always returns empty since no
/// instances are scheduled without one; `compute_node_create`/`update` just
/// log, since there is no shared database connected yet.
#[derive(Default)]
struct StandaloneStore;

#[async_trait::async_trait]
impl InstanceStore for StandaloneStore {
    async fn instance_get_all_by_host(&self, _host: &str) -> Result<Vec<Instance>> {
        Ok(vec![])
    }

    async fn instance_set_state(
        &self,
        id: u64,
        state: PowerState,
        description: Option<&str>,
    ) -> Result<()> {
        info!(id, ?state, description, "instance state transition");
        Ok(())
    }

    async fn instance_destroy(&self, id: u64) -> Result<()> {
        info!(id, "instance destroyed");
        Ok(())
    }

    async fn instance_get_fixed_address(&self, _id: u64) -> Result<Option<Ipv4Addr>> {
        Ok(None)
    }

    async fn instance_get_fixed_address_v6(&self, _id: u64) -> Result<Option<Ipv6Addr>> {
        Ok(None)
    }

    async fn security_group_get_by_instance(&self, _id: u64) -> Result<Vec<SecurityGroup>> {
        Ok(vec![])
    }

    async fn security_group_rule_get_by_security_group(&self, sg_id: u64) -> Result<SecurityGroup> {
        Err(compute_driver::error::Error::not_found(format!(
            "security group {sg_id}"
        )))
    }

    async fn network_get_by_instance(&self, _id: u64) -> Result<NetworkInfo> {
        Ok(NetworkInfo::default())
    }

    async fn instance_get_all_by_security_group(&self, _sg_id: u64) -> Result<Vec<Instance>> {
        Ok(vec![])
    }

    async fn service_get_all_compute_by_host(&self, _host: &str) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn compute_node_create(&self, record: &ComputeNodeReport) -> Result<()> {
        info!(?record, "compute node report (create)");
        Ok(())
    }

    async fn compute_node_update(&self, host: &str, record: &ComputeNodeReport) -> Result<()> {
        info!(host, ?record, "compute node report (update)");
        Ok(())
    }
}
