//! TSS node daemon.
//!
//! Parses the CLI, reads the node secret key from stdin, brings up the p2p
//! host and the HTTP admin surface, and runs until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tss_common::{NodeConfig, P2pConfig, TssConfig};
use tss_engine::mpc::dev::DevBackend;
use tss_engine::mpc::PartyBackend;
use tss_engine::TssServer;
use tss_network::conversion::keypair_from_secret_hex;
use tss_network::Communication;
use tss_storage::SqliteStateStore;

#[derive(Parser)]
#[command(name = "tss-node")]
#[command(version, about = "Threshold-signature node", long_about = None)]
struct Cli {
    /// HTTP admin bind address.
    #[arg(long = "tss-port", default_value = "127.0.0.1:8080")]
    tss_addr: String,

    /// libp2p TCP listen port.
    #[arg(long = "p2p-port", default_value_t = 6668)]
    p2p_port: u16,

    /// Rendezvous string identifying the cohort on the DHT.
    #[arg(long, default_value = "Asgard")]
    rendezvous: String,

    /// NAT-announced external IP of this node.
    #[arg(long = "external-ip")]
    external_ip: Option<String>,

    /// Bootstrap peer multiaddr; repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Keygen round timeout in seconds.
    #[arg(long, default_value_t = 30)]
    gentimeout: u64,

    /// Keysign round timeout in seconds.
    #[arg(long, default_value_t = 30)]
    signtimeout: u64,

    /// Pre-parameter generation timeout in seconds (reserved).
    #[arg(long, default_value_t = 300)]
    preparamtimeout: u64,

    /// Directory for state files.
    #[arg(long, default_value = "")]
    home: String,

    /// Log level.
    #[arg(long, default_value = "info")]
    loglevel: String,

    /// Human-readable log output instead of JSON lines.
    #[arg(long = "pretty-log", default_value_t = false)]
    pretty_log: bool,
}

impl Cli {
    fn into_config(self) -> NodeConfig {
        NodeConfig {
            http_addr: self.tss_addr,
            home: self.home,
            tss: TssConfig {
                keygen_timeout: Duration::from_secs(self.gentimeout),
                keysign_timeout: Duration::from_secs(self.signtimeout),
                preparam_timeout: Duration::from_secs(self.preparamtimeout),
            },
            p2p: P2pConfig {
                rendezvous: self.rendezvous,
                port: self.p2p_port,
                external_ip: self.external_ip,
                bootstrap_peers: self.peers,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tss_common::logging::init(&cli.loglevel, cli.pretty_log);
    let conf = cli.into_config();

    // Network selection (bech32 prefixes etc.) belongs to the layers above;
    // surface it for the operator.
    if let Ok(net) = std::env::var("NET") {
        info!("NET={}", net);
    }

    eprintln!("input node secret key:");
    let secret_hex = rpassword::read_password().context("failed to read the node secret key")?;
    let keypair = keypair_from_secret_hex(&secret_hex).context("invalid node secret key")?;

    let home = if conf.home.is_empty() {
        PathBuf::from(".")
    } else {
        let dir = PathBuf::from(&conf.home);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create home directory {}", dir.display()))?;
        dir
    };
    let storage = Arc::new(
        SqliteStateStore::open(home.join("tss-state.db")).context("cannot open the state store")?,
    );

    let join_party_window = conf.tss.keygen_timeout.max(conf.tss.keysign_timeout);
    let comm = Communication::start(keypair, &conf.p2p, join_party_window)
        .await
        .context("failed to start the p2p transport")?;
    info!("local peer id {}", tss_network::Messenger::local_peer_id(&*comm));

    let backend: Arc<dyn PartyBackend> = Arc::new(DevBackend);
    let node_key = comm.node_key().to_string();
    let server = Arc::new(TssServer::new(
        conf.tss.clone(),
        comm.clone(),
        storage,
        backend,
        node_key,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http = tokio::spawn(tss_api::serve(conf.http_addr.clone(), server.clone(), async {
        let _ = shutdown_rx.await;
    }));

    wait_for_signal().await;
    info!("shutting down");

    server.stop();
    let _ = shutdown_tx.send(());
    comm.stop().await;
    let _ = http.await;

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
