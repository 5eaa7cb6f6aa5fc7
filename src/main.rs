use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use mountq::client::QueueClient;
use mountq::config::ServerConfig;
use mountq::proto::{
    DedicateMsg, DeleteDriveMsg, DriveStatus, VolumePriorityMsg, VolumeRequestMsg,
};
use mountq::server::Server;
use mountq::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "mountq")]
#[command(version)]
#[command(about = "A volume and drive queue server for tape archival")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the queue server
    Server(ServerArgs),

    /// Probe the server, or query a request's queue position
    Ping {
        #[command(flatten)]
        client: ClientArgs,

        /// Request id to query; omit for a liveness probe
        #[arg(long)]
        reqid: Option<i32>,

        /// Drive group of the request
        #[arg(long, requires = "reqid")]
        dgn: Option<String>,
    },

    /// Pause matching server-wide; queued state is untouched
    Hold {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Resume matching
    Release {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Stop the server
    Shutdown {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Queue a volume mount request
    Request {
        #[command(flatten)]
        client: ClientArgs,

        /// Volume id (up to 6 characters)
        #[arg(long)]
        vid: String,

        /// Drive group name
        #[arg(long)]
        dgn: String,

        /// Access mode
        #[arg(long, default_value = "read")]
        mode: ModeArg,

        /// Scheduling priority, higher first
        #[arg(long, default_value = "0")]
        priority: i32,

        /// Callback host for the copy-execution service
        #[arg(long, default_value = "")]
        host: String,

        /// Callback port for the copy-execution service
        #[arg(long, default_value = "0")]
        port: i32,
    },

    /// Install or clear a drive dedication rule
    Dedicate {
        #[command(flatten)]
        client: ClientArgs,

        /// Tape server hosting the drive
        #[arg(long)]
        server: String,

        /// Drive unit name
        #[arg(long)]
        drive: String,

        /// Drive group name
        #[arg(long)]
        dgn: String,

        /// Rule text, e.g. "uid=42,host=client*"; empty clears the rule
        #[arg(long, default_value = "")]
        rule: String,
    },

    /// Delete a pending or running volume request
    Delvol {
        #[command(flatten)]
        client: ClientArgs,

        #[arg(long)]
        dgn: String,

        #[arg(long)]
        reqid: i32,
    },

    /// Remove a drive from its group
    Deldrv {
        #[command(flatten)]
        client: ClientArgs,

        #[arg(long)]
        server: String,

        #[arg(long)]
        drive: String,

        #[arg(long)]
        dgn: String,
    },

    /// Adjust the priority of queued requests for a volume
    Setprio {
        #[command(flatten)]
        client: ClientArgs,

        #[arg(long)]
        vid: String,

        #[arg(long)]
        priority: i32,

        /// Restrict to one access mode
        #[arg(long)]
        mode: Option<ModeArg>,
    },

    /// Re-queue a running request so it can match a different drive
    Reselect {
        #[command(flatten)]
        client: ClientArgs,

        #[arg(long)]
        dgn: String,

        #[arg(long)]
        reqid: i32,
    },

    /// List the volume queue, or the drive queue with --drives
    Queue {
        #[command(flatten)]
        client: ClientArgs,

        /// Restrict to one drive group
        #[arg(long)]
        dgn: Option<String>,

        /// List registered drives instead of pending requests
        #[arg(long)]
        drives: bool,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:5012")]
    listen: SocketAddr,

    /// Port of the copy-execution service on each tape server
    #[arg(long, default_value = "5003")]
    copyd_port: u16,

    /// Seconds to wait for a start-job acknowledgement
    #[arg(long, default_value = "5")]
    dispatch_timeout: u64,

    /// Seconds a drive is skipped after a dispatch failure
    #[arg(long, default_value = "30")]
    retry_backoff: u64,

    /// Upper bound on pending requests per drive group
    #[arg(long, default_value = "10000")]
    max_queue_len: usize,

    /// Start with matching held (maintenance mode)
    #[arg(long)]
    held: bool,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Queue server address
    #[arg(long, short = 'a', default_value = "127.0.0.1:5012")]
    addr: SocketAddr,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Read,
    Write,
}

impl ModeArg {
    fn to_wire(self) -> i32 {
        match self {
            ModeArg::Read => 0,
            ModeArg::Write => 1,
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct PingOutput {
    request_id: i32,
    position: i32,
    running: bool,
}

#[derive(Serialize)]
struct LivenessOutput {
    status: String,
}

#[derive(Serialize)]
struct RequestOutput {
    request_id: i32,
    position: i32,
}

#[derive(Serialize)]
struct VolumeRowOutput {
    request_id: i32,
    volume_id: String,
    drive_group: String,
    mode: String,
    priority: i32,
    client: String,
    drive_id: i32,
}

#[derive(Serialize)]
struct VolumeQueueOutput {
    requests: Vec<VolumeRowOutput>,
}

#[derive(Serialize)]
struct DriveRowOutput {
    drive_id: i32,
    drive: String,
    server: String,
    drive_group: String,
    status: String,
    request_id: i32,
    volume_id: String,
    usage_count: i32,
    error_count: i32,
    dedicate: String,
}

#[derive(Serialize)]
struct DriveQueueOutput {
    drives: Vec<DriveRowOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn mode_to_string(mode: i32) -> String {
    match mode {
        0 => "read".to_string(),
        1 => "write".to_string(),
        other => format!("mode{other}"),
    }
}

fn status_to_string(status: i32) -> String {
    let bits = DriveStatus::from_bits_truncate(status);
    if bits.contains(DriveStatus::UNIT_DOWN) {
        "DOWN".to_string()
    } else if bits.contains(DriveStatus::UNIT_BUSY) {
        "BUSY".to_string()
    } else if bits.contains(DriveStatus::UNIT_FREE) {
        "FREE".to_string()
    } else {
        "UNKNOWN".to_string()
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig {
        listen_addr: args.listen,
        copyd_port: args.copyd_port,
        dispatch_timeout: Duration::from_secs(args.dispatch_timeout),
        dispatch_retry_backoff: Duration::from_secs(args.retry_backoff),
        max_queue_len: args.max_queue_len,
        start_held: args.held,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        copyd_port = config.copyd_port,
        held = config.start_held,
        "Starting queue server"
    );

    let shutdown = install_shutdown_handler()?;
    let server = Server::bind(config, shutdown).await?;
    server.run().await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_ping(
    client: &QueueClient,
    reqid: Option<i32>,
    dgn: Option<String>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match reqid {
        Some(reqid) => {
            let position = client.ping(dgn.as_deref().unwrap_or_default(), reqid).await?;
            match output {
                OutputFormat::Json => {
                    let out = PingOutput {
                        request_id: reqid,
                        position,
                        running: position == 0,
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => {
                    if position == 0 {
                        println!("Request {} is running", reqid);
                    } else {
                        println!("Request {} is at queue position {}", reqid, position);
                    }
                }
            }
        }
        None => {
            let status = client.liveness().await;
            match output {
                OutputFormat::Json => {
                    let out = LivenessOutput {
                        status: status.to_string(),
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => println!("{}", status),
            }
        }
    }
    Ok(())
}

async fn handle_queue(
    client: &QueueClient,
    dgn: Option<String>,
    drives: bool,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if drives {
        let rows: Vec<DriveRowOutput> = client
            .drive_queue(dgn.as_deref())
            .await?
            .into_iter()
            .map(|d| DriveRowOutput {
                drive_id: d.drive_id,
                drive: d.drive,
                server: d.server,
                drive_group: d.drive_group,
                status: status_to_string(d.status),
                request_id: d.request_id,
                volume_id: d.volume_id,
                usage_count: d.usage_count,
                error_count: d.error_count,
                dedicate: d.dedicate,
            })
            .collect();

        match output {
            OutputFormat::Json => {
                let out = DriveQueueOutput { drives: rows };
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            OutputFormat::Table => {
                if rows.is_empty() {
                    println!("No drives registered.");
                } else {
                    println!(
                        "{:<6} {:<10} {:<24} {:<8} {:<8} {:<8} {:<8} DEDICATION",
                        "ID", "DRIVE", "SERVER", "GROUP", "STATUS", "REQID", "VID"
                    );
                    println!("{}", "-".repeat(90));
                    for d in &rows {
                        let reqid = if d.request_id > 0 {
                            d.request_id.to_string()
                        } else {
                            "-".to_string()
                        };
                        let vid = if d.volume_id.is_empty() {
                            "-".to_string()
                        } else {
                            d.volume_id.clone()
                        };
                        println!(
                            "{:<6} {:<10} {:<24} {:<8} {:<8} {:<8} {:<8} {}",
                            d.drive_id,
                            d.drive,
                            d.server,
                            d.drive_group,
                            d.status,
                            reqid,
                            vid,
                            d.dedicate
                        );
                    }
                }
            }
        }
    } else {
        let rows: Vec<VolumeRowOutput> = client
            .volume_queue(dgn.as_deref())
            .await?
            .into_iter()
            .map(|r| VolumeRowOutput {
                request_id: r.request_id,
                volume_id: r.volume_id,
                drive_group: r.drive_group,
                mode: mode_to_string(r.mode),
                priority: r.priority,
                client: format!("{}:{}", r.client_host, r.client_port),
                drive_id: r.drive_id,
            })
            .collect();

        match output {
            OutputFormat::Json => {
                let out = VolumeQueueOutput { requests: rows };
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            OutputFormat::Table => {
                if rows.is_empty() {
                    println!("No pending requests.");
                } else {
                    println!(
                        "{:<8} {:<8} {:<8} {:<6} {:<6} {:<8} CLIENT",
                        "REQID", "VID", "GROUP", "MODE", "PRIO", "DRIVE"
                    );
                    println!("{}", "-".repeat(70));
                    for r in &rows {
                        let drive = if r.drive_id > 0 {
                            r.drive_id.to_string()
                        } else {
                            "-".to_string()
                        };
                        println!(
                            "{:<8} {:<8} {:<8} {:<6} {:<6} {:<8} {}",
                            r.request_id, r.volume_id, r.drive_group, r.mode, r.priority, drive,
                            r.client
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Ping { client, reqid, dgn } => {
            let qc = QueueClient::new(client.addr);
            handle_ping(&qc, reqid, dgn, &client.output).await?;
        }
        Commands::Hold { client } => {
            QueueClient::new(client.addr).hold().await?;
            println!("Matching held.");
        }
        Commands::Release { client } => {
            QueueClient::new(client.addr).release().await?;
            println!("Matching released.");
        }
        Commands::Shutdown { client } => {
            QueueClient::new(client.addr).shutdown().await?;
            println!("Shutdown requested.");
        }
        Commands::Request {
            client,
            vid,
            dgn,
            mode,
            priority,
            host,
            port,
        } => {
            let qc = QueueClient::new(client.addr);
            let ack = qc
                .request_volume(VolumeRequestMsg {
                    priority,
                    client_port: port,
                    mode: mode.to_wire(),
                    client_host: host,
                    volume_id: vid,
                    drive_group: dgn,
                    ..Default::default()
                })
                .await?;
            match client.output {
                OutputFormat::Json => {
                    let out = RequestOutput {
                        request_id: ack.request_id,
                        position: ack.queue_position,
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => {
                    println!("Request queued.");
                    println!("Request ID: {}", ack.request_id);
                    println!("Position:   {}", ack.queue_position);
                }
            }
        }
        Commands::Dedicate {
            client,
            server,
            drive,
            dgn,
            rule,
        } => {
            QueueClient::new(client.addr)
                .dedicate(DedicateMsg {
                    server,
                    drive,
                    drive_group: dgn,
                    dedicate: rule,
                    ..Default::default()
                })
                .await?;
            println!("Dedication updated.");
        }
        Commands::Delvol { client, dgn, reqid } => {
            QueueClient::new(client.addr).delete_volume(&dgn, reqid).await?;
            println!("Request {} deleted.", reqid);
        }
        Commands::Deldrv {
            client,
            server,
            drive,
            dgn,
        } => {
            QueueClient::new(client.addr)
                .delete_drive(DeleteDriveMsg {
                    server,
                    drive,
                    drive_group: dgn,
                    ..Default::default()
                })
                .await?;
            println!("Drive deleted.");
        }
        Commands::Setprio {
            client,
            vid,
            priority,
            mode,
        } => {
            QueueClient::new(client.addr)
                .set_priority(VolumePriorityMsg {
                    priority,
                    mode: mode.map(ModeArg::to_wire).unwrap_or(-1),
                    volume_id: vid,
                    ..Default::default()
                })
                .await?;
            println!("Priority updated.");
        }
        Commands::Reselect { client, dgn, reqid } => {
            QueueClient::new(client.addr).reselect(&dgn, reqid).await?;
            println!("Request {} re-queued.", reqid);
        }
        Commands::Queue {
            client,
            dgn,
            drives,
        } => {
            let qc = QueueClient::new(client.addr);
            handle_queue(&qc, dgn, drives, &client.output).await?;
        }
    }

    Ok(())
}
