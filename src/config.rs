use crate::master::MasterConfig;
use crate::slave::SlaveConfig;
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Replicated key-value store with a two-phase-commit master
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinator
    Master(MasterArgs),
    /// Run a storage node and register it with the master
    Slave(SlaveArgs),
    /// Send one request to a master or slave
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct MasterArgs {
    /// Number of slaves that must register before clients are served
    #[arg(long, default_value = "2")]
    pub slaves: usize,

    /// Address clients connect to
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub client_addr: String,

    /// Address slaves register on
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub registration_addr: String,

    /// Concurrent connections per listener
    #[arg(short, long, default_value = "4")]
    pub connections: usize,

    #[arg(long, default_value = "100")]
    pub cache_sets: usize,

    #[arg(long, default_value = "10")]
    pub cache_set_size: usize,

    /// How long to wait on a slave, in milliseconds
    #[arg(long, default_value = "5000")]
    pub timeout_ms: u64,
}

impl MasterArgs {
    pub fn master_config(&self) -> MasterConfig {
        MasterConfig {
            expected_slaves: self.slaves,
            vote_timeout: Duration::from_millis(self.timeout_ms),
            cache_sets: self.cache_sets,
            cache_set_size: self.cache_set_size,
            ..MasterConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct SlaveArgs {
    /// Position on the ring, random if not given
    #[arg(long, allow_negative_numbers = true)]
    pub id: Option<i64>,

    /// Master registration address
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub master: String,

    /// Address to accept master connections on
    #[arg(long, default_value = "127.0.0.1:0")]
    pub listen: String,

    /// Host the master should connect back to, defaults to the listen host
    #[arg(long)]
    pub advertise_host: Option<String>,

    /// Write-ahead log file
    #[arg(long, default_value = "tpckv-slave.log")]
    pub log: PathBuf,

    /// Concurrent connections
    #[arg(short, long, default_value = "4")]
    pub connections: usize,

    #[arg(long, default_value = "10")]
    pub cache_sets: usize,

    #[arg(long, default_value = "10")]
    pub cache_set_size: usize,
}

impl SlaveArgs {
    pub fn slave_config(&self) -> SlaveConfig {
        let id = self.id.unwrap_or_else(|| rand::rng().random());
        SlaveConfig {
            id: id as u64,
            cache_sets: self.cache_sets,
            cache_set_size: self.cache_set_size,
            log_path: self.log.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Master client address, or a slave address for ignore-next
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    pub server: String,

    #[command(subcommand)]
    pub op: ClientOp,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ClientOp {
    Get { key: String },
    Put { key: String, value: String },
    Del { key: String },
    /// Make a slave refuse its next vote
    IgnoreNext,
}
