use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use netmeter::config::{Config, Protocol};
use netmeter::orchestrator::{analyze_player_log, Monitor, MonitorConfig};
use netmeter::{Client, Server};

#[derive(Parser)]
#[command(name = "netmeter", version, about = "Network throughput measurement tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in server mode, waiting for clients
    Server {
        /// Control port to listen on (data streams use port + 1)
        #[arg(short, long, default_value_t = 5201)]
        port: u16,

        /// Address to bind; all interfaces when omitted
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },

    /// Run a test against a server
    Client {
        /// Server host name or address
        server: String,

        /// Server control port
        #[arg(short, long, default_value_t = 5201)]
        port: u16,

        /// Use UDP instead of TCP (requires --bandwidth)
        #[arg(short, long)]
        udp: bool,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value_t = 10)]
        time: u64,

        /// Target bitrate in Mbps (UDP only)
        #[arg(short, long)]
        bandwidth: Option<f64>,

        /// Payload size per write/datagram in bytes
        #[arg(short, long)]
        length: Option<usize>,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value_t = 1)]
        parallel: usize,

        /// Write the JSON report to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Repeatedly test a server on a fixed cadence
    Monitor {
        /// Server host name or address
        server: String,

        /// Server control port
        #[arg(short, long, default_value_t = 5201)]
        port: u16,

        /// Total monitoring window in seconds
        #[arg(short, long, default_value_t = 3600)]
        duration: u64,

        /// Seconds between cycle starts
        #[arg(short, long, default_value_t = 300)]
        interval: u64,

        /// Duration of each individual sub-test in seconds
        #[arg(short = 't', long, default_value_t = 10)]
        time: u64,

        /// Also run a UDP sub-test each cycle (requires --bandwidth)
        #[arg(short, long)]
        udp: bool,

        /// Target bitrate for the UDP sub-tests in Mbps
        #[arg(short, long)]
        bandwidth: Option<f64>,

        /// Directory for result artifacts
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Summarize a JSON-lines player-quality log
    Analyze {
        /// Path to the log file
        logfile: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("netmeter {} starting", netmeter::VERSION);
    let cli = Cli::parse();

    match cli.command {
        Command::Server { port, bind } => {
            let server = Server::new(port, bind);
            server.run().await.context("server failed")?;
        }

        Command::Client {
            server,
            port,
            udp,
            time,
            bandwidth,
            length,
            parallel,
            output,
        } => {
            let mut config = Config::client(server, port)
                .with_duration(Duration::from_secs(time))
                .with_parallel(parallel);
            if udp {
                config = config.with_protocol(Protocol::Udp);
                let mbps = bandwidth
                    .context("UDP tests require --bandwidth (target rate in Mbps)")?;
                config = config.with_bitrate(mbps_to_bps(mbps)?);
            } else if bandwidth.is_some() {
                anyhow::bail!("--bandwidth applies to UDP tests only");
            }
            if let Some(length) = length {
                config = config.with_payload_size(length);
            }
            if let Some(path) = output {
                config = config.with_output(path);
            }
            // Surface parameter mistakes before touching the network.
            config.validate().context("invalid test parameters")?;

            let report = Client::new(config).run().await.context("test failed")?;
            report.print_summary();
        }

        Command::Monitor {
            server,
            port,
            duration,
            interval,
            time,
            udp,
            bandwidth,
            output,
        } => {
            anyhow::ensure!(interval > 0, "--interval must be > 0");
            anyhow::ensure!(
                interval >= time,
                "--interval must be at least the sub-test duration"
            );
            let udp_bitrate = if udp {
                let mbps = bandwidth
                    .context("--udp requires --bandwidth (target rate in Mbps)")?;
                Some(mbps_to_bps(mbps)?)
            } else {
                anyhow::ensure!(bandwidth.is_none(), "--bandwidth applies to UDP sub-tests only");
                None
            };
            let monitor = Monitor::new(MonitorConfig {
                server,
                port,
                total_duration: Duration::from_secs(duration),
                interval: Duration::from_secs(interval),
                test_duration: Duration::from_secs(time),
                parallel: 1,
                udp_bitrate,
                output_dir: output,
            });
            monitor.run().await.context("monitoring run failed")?;
        }

        Command::Analyze { logfile } => {
            let summary = analyze_player_log(&logfile)
                .with_context(|| format!("could not analyze {}", logfile.display()))?;
            info!("analyzed {} records", summary.total_records);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn mbps_to_bps(mbps: f64) -> anyhow::Result<u64> {
    anyhow::ensure!(mbps > 0.0, "bitrate must be positive");
    Ok((mbps * 1e6) as u64)
}
