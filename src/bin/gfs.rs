//! Command-line client for the master.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use byte_unit::Byte;
use clap::{Parser, Subcommand};
use env_logger::Env;

use gfs::client::Client;
use gfs::config::{MasterConfig, DEFAULT_MAX_CHUNK_BYTES};

#[derive(Parser, Debug)]
#[command(name = "gfs", about = "Client for the file system master")]
struct Args {
    /// Master address
    #[arg(short, long, default_value = "localhost:9000", global = true)]
    master: String,

    /// Request timeout in seconds. Keep it at least replication factor x
    /// (data timeout + control timeout) of the master, or a slow upload may
    /// be reported as failed after the master has committed it.
    #[arg(long, default_value_t = MasterConfig::default().client_timeout().as_secs(), global = true)]
    timeout: u64,

    /// Largest file the master accepts, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_CHUNK_BYTES, global = true)]
    max_chunk_bytes: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file under NAME
    Upload { name: String, path: PathBuf },
    /// Download NAME to a local file, or to stdout
    Download {
        name: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List files whose name starts with PREFIX
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Delete NAME
    Rm { name: String },
    /// Show where a chunk of NAME is stored
    Locate {
        name: String,
        #[arg(default_value_t = 0)]
        index: usize,
    },
    /// Show chunkserver liveness
    Status,
}

fn report(success: bool, message: &str) -> ExitCode {
    if success {
        println!("{message}");
        ExitCode::SUCCESS
    } else {
        eprintln!("error: {message}");
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let client = Client::new(args.master.clone())
        .with_timeout(std::time::Duration::from_secs(args.timeout))
        .with_max_chunk_bytes(args.max_chunk_bytes);

    let code = match args.command {
        Command::Upload { name, path } => {
            let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let resp = client.upload(&name, &data).await?;
            if resp.success {
                println!("{name}: {:#} on {}", Byte::from_u64(data.len() as u64), resp.replicas.join(", "));
            }
            report(resp.success, &resp.message)
        }
        Command::Download { name, output } => {
            let resp = client.download(&name).await?;
            if !resp.success {
                return Ok(report(false, &resp.message));
            }
            match output {
                Some(path) => {
                    std::fs::write(&path, &resp.data).with_context(|| format!("writing {}", path.display()))?;
                    println!("{name}: {:#} written to {}", Byte::from_u64(resp.data.len() as u64), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&resp.data)?;
                }
            }
            ExitCode::SUCCESS
        }
        Command::Ls { prefix } => {
            let resp = client.list(&prefix).await?;
            for file in &resp.files {
                println!("{file}");
            }
            if resp.success { ExitCode::SUCCESS } else { report(false, &resp.message) }
        }
        Command::Rm { name } => {
            let resp = client.delete(&name).await?;
            report(resp.success, &resp.message)
        }
        Command::Locate { name, index } => {
            let resp = client.locate_chunk(&name, index).await?;
            match resp.location {
                Some(location) => {
                    println!("chunk {}", location.handle);
                    for address in &location.addresses {
                        println!("  {address}");
                    }
                    ExitCode::SUCCESS
                }
                None => report(false, &resp.message),
            }
        }
        Command::Status => {
            let status = client.status().await?;
            println!("files: {}  replication factor: {}", status.file_count, status.replication_factor);
            for cs in &status.chunkservers {
                println!("  {:<24} {:?} (last heartbeat {}s ago)", cs.address, cs.liveness(), cs.seconds_since_heartbeat);
            }
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}
