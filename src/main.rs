use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tpckv::{
    serve_clients, serve_registrations, ClientArgs, ClientOp, Command, Config, KvClient,
    MasterArgs, SlaveArgs, TpcMaster, TpcSlave,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .thread_name("tpckv")
        .enable_all()
        .build()?;

    rt.block_on(async move {
        match config.command {
            Command::Master(args) => run_master(args).await,
            Command::Slave(args) => run_slave(args).await,
            Command::Client(args) => run_client(args).await,
        }
    })
}

async fn run_master(args: MasterArgs) -> Result<()> {
    let master = Arc::new(TpcMaster::new(args.master_config()));

    let registrations = TcpListener::bind(&args.registration_addr)
        .await
        .with_context(|| format!("binding registration address {}", args.registration_addr))?;
    let clients = TcpListener::bind(&args.client_addr)
        .await
        .with_context(|| format!("binding client address {}", args.client_addr))?;

    info!(
        "Waiting for {} slaves on {}, serving clients on {}",
        args.slaves, args.registration_addr, args.client_addr
    );

    // registrations are served one at a time
    let registering = tokio::spawn(serve_registrations(master.clone(), registrations, 1));
    let serving = tokio::spawn(serve_clients(master, clients, args.connections));
    registering.await?;
    serving.await?;
    Ok(())
}

async fn run_slave(args: SlaveArgs) -> Result<()> {
    let config = args.slave_config();
    let slave = Arc::new(
        TpcSlave::new(config)
            .await
            .with_context(|| format!("opening log {}", args.log.display()))?,
    );

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    let local = listener.local_addr()?;
    let host = args
        .advertise_host
        .clone()
        .unwrap_or_else(|| local.ip().to_string());
    let advertised = format!("{}:{}", host, local.port());

    info!("Slave {} listening on {}", slave.id() as i64, local);
    let serving = tokio::spawn(slave.clone().serve(listener, args.connections));

    let reply = slave
        .register_with_master(&args.master, &advertised)
        .await
        .with_context(|| format!("registering with master at {}", args.master))?;
    info!("{}", reply);

    let in_doubt = slave.in_doubt().await;
    if !in_doubt.is_empty() {
        warn!("Waiting on master decisions for operations {:?}", in_doubt);
    }

    serving.await?;
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let client = KvClient::new(args.server);
    match args.op {
        ClientOp::Get { key } => {
            let value = client.get(&key).await?;
            println!("{value}");
        }
        ClientOp::Put { key, value } => {
            client.put(&key, &value).await?;
            println!("Success");
        }
        ClientOp::Del { key } => {
            client.del(&key).await?;
            println!("Success");
        }
        ClientOp::IgnoreNext => {
            client.ignore_next().await?;
            println!("Success");
        }
    }
    Ok(())
}
