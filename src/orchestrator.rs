// SPDX-License-Identifier: Apache-2.0 OR MIT
//! The external driver: builds one proxy instance per routing table and
//! forwards administrative messages.
//!
//! Thin glue by design. The orchestrator resolves configured interface
//! names, constructs the instances (each exclusively owned here, looked up
//! by table id), posts the initial add-upstream/add-downstream messages,
//! and then parks on the shutdown flag, optionally printing status
//! snapshots. It never touches membership state; everything it wants from
//! an instance goes through `submit`.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;

use crate::config::{Config, InstanceConfig};
use crate::logging::{Facility, Logger};
use crate::protocols::ProtocolFamily;
use crate::proxy::{InterfaceSpec, ProxyHandle, ProxyInstance, ProxyMessage, StatusDetail};
use crate::shutdown::ShutdownFlag;
use crate::timing::TimingService;
use crate::{log_critical, log_info, log_notice};
use crate::RouteTableId;

/// Cadence of `-s` status printing.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// One running instance and the tasks serving it.
struct ManagedInstance {
    handle: ProxyHandle,
    instance_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

/// Run the proxy to completion: construct instances, wait for shutdown,
/// then drain the instance tasks.
pub async fn run(
    config: &Config,
    print_status: bool,
    timing: TimingService,
    shutdown: ShutdownFlag,
    logger: Logger,
) -> Result<()> {
    config
        .validate_global()
        .context("configuration rejected")?;

    let querier_config = config.timers.querier_config();
    let single_instance = config.instances.len() <= 1;

    let mut instances: BTreeMap<RouteTableId, ManagedInstance> = BTreeMap::new();
    for instance_config in &config.instances {
        // With a single configured mapping everything lands in table 0.
        let table = if single_instance {
            RouteTableId(0)
        } else {
            instance_config.table_id()
        };

        // A bad instance is fatal to that instance only.
        if let Err(e) = instance_config.validate() {
            log_critical!(
                logger,
                Facility::Orchestrator,
                &format!("skipping {}: {}", table, e)
            );
            continue;
        }

        match start_instance(
            table,
            instance_config,
            config.protocol,
            querier_config.clone(),
            timing.clone(),
            shutdown.clone(),
            logger.clone(),
        ) {
            Ok(managed) => {
                instances.insert(table, managed);
            }
            Err(e) => {
                log_critical!(
                    logger,
                    Facility::Orchestrator,
                    &format!("failed to start {}: {:#}", table, e)
                );
            }
        }
    }

    if instances.is_empty() {
        bail!("no proxy instance could be started");
    }
    log_notice!(
        logger,
        Facility::Orchestrator,
        &format!("{} proxy instance(s) running", instances.len())
    );

    // Park until the signal path raises the flag. No polling: the status
    // printer is the only periodic work, and only when asked for.
    if print_status {
        status_loop(&instances, &shutdown).await;
    } else {
        shutdown.wait().await;
    }

    log_notice!(logger, Facility::Orchestrator, "shutting down instances");
    for (table, managed) in instances {
        if managed.instance_task.await.is_err() {
            log_critical!(
                logger,
                Facility::Orchestrator,
                &format!("{}: instance task panicked", table)
            );
        }
        managed.reader_task.abort();
    }
    Ok(())
}

/// Print every instance's status until shutdown.
async fn status_loop(instances: &BTreeMap<RouteTableId, ManagedInstance>, shutdown: &ShutdownFlag) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                for managed in instances.values() {
                    if let Ok(status) = managed.handle.status(StatusDetail::Full).await {
                        println!("{}", status);
                    }
                }
            }
        }
    }
}

fn start_instance(
    table: RouteTableId,
    instance_config: &InstanceConfig,
    family: ProtocolFamily,
    querier_config: crate::protocols::QuerierConfig,
    timing: TimingService,
    shutdown: ShutdownFlag,
    logger: Logger,
) -> Result<ManagedInstance> {
    let upstream = resolve_interface(&instance_config.upstream, family)?;
    let downstreams: Vec<InterfaceSpec> = instance_config
        .downstreams
        .iter()
        .map(|name| resolve_interface(name, family))
        .collect::<Result<_>>()?;

    let gateway = crate::kernel::mrt::MrtGateway::new(family, table, logger.clone())
        .with_context(|| format!("{}: kernel gateway", table))?;
    let reader_fd = gateway
        .clone_fd()
        .context("duplicating gateway socket for reader")?;

    let instance = ProxyInstance::new(
        table,
        family,
        querier_config,
        Box::new(gateway),
        timing,
        shutdown.clone(),
        logger.clone(),
    );
    let handle = instance.handle();

    // Initial topology, as messages like everything else.
    handle
        .submit(ProxyMessage::AddUpstream(upstream))
        .expect("fresh instance accepts messages");
    for spec in downstreams {
        handle
            .submit(ProxyMessage::AddDownstream(spec))
            .expect("fresh instance accepts messages");
    }

    let reader =
        crate::kernel::reader::PacketReader::new(reader_fd, family, handle.clone(), logger.clone())
            .context("packet reader")?;

    log_info!(
        logger,
        Facility::Orchestrator,
        &format!("{}: instance constructed", table)
    );

    Ok(ManagedInstance {
        handle,
        instance_task: tokio::spawn(instance.run()),
        reader_task: tokio::spawn(reader.run(shutdown)),
    })
}

/// Resolve a configured interface name to its index and a usable source
/// address for the protocol family.
fn resolve_interface(name: &str, family: ProtocolFamily) -> Result<InterfaceSpec> {
    let interface = pnet::datalink::interfaces()
        .into_iter()
        .find(|candidate| candidate.name == name)
        .with_context(|| format!("interface '{}' not found", name))?;

    let addr = pick_source_address(&interface.ips, family)
        .with_context(|| format!("interface '{}' has no {} address", name, family))?;

    Ok(InterfaceSpec {
        ifindex: interface.index,
        name: interface.name,
        addr,
    })
}

/// Queries are sourced from a link-scoped address for MLD and any
/// configured IPv4 address for IGMP.
fn pick_source_address(
    networks: &[pnet::ipnetwork::IpNetwork],
    family: ProtocolFamily,
) -> Option<IpAddr> {
    match family {
        ProtocolFamily::Igmp => networks
            .iter()
            .map(|network| network.ip())
            .find(|addr| addr.is_ipv4()),
        ProtocolFamily::Mld => {
            let v6 = networks
                .iter()
                .map(|network| network.ip())
                .filter_map(|addr| match addr {
                    IpAddr::V6(v6) => Some(v6),
                    IpAddr::V4(_) => None,
                });
            let mut fallback = None;
            for addr in v6 {
                if addr.segments()[0] & 0xffc0 == 0xfe80 {
                    return Some(IpAddr::V6(addr));
                }
                fallback.get_or_insert(IpAddr::V6(addr));
            }
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(s: &str) -> pnet::ipnetwork::IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_pick_igmp_source_skips_v6() {
        let networks = vec![network("fe80::1/64"), network("192.168.1.1/24")];
        assert_eq!(
            pick_source_address(&networks, ProtocolFamily::Igmp),
            Some("192.168.1.1".parse().unwrap())
        );
    }

    #[test]
    fn test_pick_mld_source_prefers_link_local() {
        let networks = vec![network("2001:db8::1/64"), network("fe80::1/64")];
        assert_eq!(
            pick_source_address(&networks, ProtocolFamily::Mld),
            Some("fe80::1".parse().unwrap())
        );
    }

    #[test]
    fn test_pick_mld_source_falls_back_to_global() {
        let networks = vec![network("2001:db8::1/64")];
        assert_eq!(
            pick_source_address(&networks, ProtocolFamily::Mld),
            Some("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn test_no_usable_address() {
        let networks = vec![network("192.168.1.1/24")];
        assert_eq!(pick_source_address(&networks, ProtocolFamily::Mld), None);
    }
}
