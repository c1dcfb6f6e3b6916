// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use mgproxy::config::Config;
use mgproxy::logging::{LogRegistry, Severity, StderrSink};
use mgproxy::protocols::ProtocolFamily;
use mgproxy::shutdown::{install_signal_handlers, ShutdownFlag};
use mgproxy::timing::TimingService;
use mgproxy::{orchestrator, RouteTableId};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Be verbose. Give twice to see even more messages.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug, PartialEq)]
enum Command {
    /// Run the proxy daemon
    Run {
        /// Configuration file path
        #[arg(short = 'f', long, default_value = "/etc/mgproxy.conf")]
        config: PathBuf,
        /// Print proxy status information repeatedly
        #[arg(short = 's', long)]
        status: bool,
    },
    /// Check the kernel's multicast routing support and exit
    CheckKernel,
    /// Validate a configuration file and exit
    Validate {
        #[arg(short = 'f', long, default_value = "/etc/mgproxy.conf")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let severity = match args.verbose {
        0 => Severity::Notice,
        1 => Severity::Info,
        _ => Severity::Debug,
    };
    let (registry, consumer) = LogRegistry::new(severity);
    let logger = registry.logger();
    tokio::spawn(consumer.run(StderrSink));

    match args.command {
        Command::Run { config, status } => {
            if !nix::unistd::geteuid().is_root() {
                bail!("mgproxyd has to be started with root privileges");
            }
            let config = Config::load_from_file(&config).context("loading configuration")?;

            let shutdown = ShutdownFlag::new();
            install_signal_handlers(shutdown.clone(), logger.clone())?;

            let (timing, timing_worker) = TimingService::new(logger.clone());
            tokio::spawn(timing_worker.run());

            orchestrator::run(&config, status, timing, shutdown, logger).await?;
        }
        Command::CheckKernel => {
            if !nix::unistd::geteuid().is_root() {
                bail!("kernel feature checks require root privileges");
            }
            check_kernel(logger);
        }
        Command::Validate { config } => {
            let config = Config::load_from_file(&config).context("loading configuration")?;
            config.validate().context("validating configuration")?;
            println!("configuration ok: {} instance(s)", config.instances.len());
        }
    }

    Ok(())
}

/// Probe both protocol families by briefly claiming table 0.
fn check_kernel(logger: mgproxy::logging::Logger) {
    use mgproxy::kernel::mrt::MrtGateway;

    for family in [ProtocolFamily::Igmp, ProtocolFamily::Mld] {
        match MrtGateway::new(family, RouteTableId(0), logger.clone()) {
            Ok(_gateway) => println!("{}: multicast routing available", family),
            Err(e) => println!("{}: unavailable ({})", family, e),
        }
    }
}
