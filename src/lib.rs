pub mod cache;
pub mod client;
mod config;
pub mod db;
pub mod error;
mod handlers;
pub mod master;
pub mod messages;
pub mod net;
pub mod registry;
pub mod server;
pub mod slave;
pub mod wal;

pub use cache::{CacheSet, KvCache};
pub use client::KvClient;
pub use config::{ClientArgs, ClientOp, Command, Config, MasterArgs, SlaveArgs};
pub use db::KvStore;
pub use error::{KvError, KvResult};
pub use handlers::{serve_clients, serve_registrations};
pub use master::{MasterConfig, TpcMaster};
pub use messages::{KvMessage, OpId};
pub use registry::{hash_to_64, Registry, SlaveInfo};
pub use server::KvServer;
pub use slave::{SlaveConfig, TpcSlave};
pub use wal::{LogEntry, TpcLog};
