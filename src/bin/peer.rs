//! Thin process entry point: parses the CLI, then either generates key
//! material or wires a [`Transport`] together from a loaded config and runs
//! it until the process is killed.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use dfl_transport::cli::{Cli, Command};
use dfl_transport::clock::spawn_background_loops;
use dfl_transport::config::TransportConfig;
use dfl_transport::fragment_cache::FragmentCache;
use dfl_transport::keystore::{self, KeyStore};
use dfl_transport::metrics::Metrics;
use dfl_transport::mixer::Mixer;
use dfl_transport::session_switch::SessionSwitch;
use dfl_transport::sphinx::{PacketCodec, SphinxParams};
use dfl_transport::transport::Transport;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Keygen { n_nodes, out_dir } => run_keygen(n_nodes, &out_dir),
        Command::Run { config } => run_peer(&config).await,
    }
}

fn run_keygen(n_nodes: u32, out_dir: &Path) {
    if let Err(error) = std::fs::create_dir_all(out_dir) {
        eprintln!("failed to create {}: {error}", out_dir.display());
        std::process::exit(1);
    }
    let keys = keystore::generate_network_keys(n_nodes);
    let public_list: Vec<_> = keys.iter().map(|(id, _, public)| (*id, *public)).collect();

    if let Err(error) = keystore::write_public_key_file(&out_dir.join("network.pub"), &public_list) {
        eprintln!("failed to write network.pub: {error}");
        std::process::exit(1);
    }
    for (id, private, _) in &keys {
        let path = out_dir.join(format!("node{id}.priv"));
        if let Err(error) = keystore::write_private_key_file(&path, private) {
            eprintln!("failed to write {}: {error}", path.display());
            std::process::exit(1);
        }
    }
    println!("wrote keys for {n_nodes} nodes to {}", out_dir.display());
}

async fn run_peer(config_path: &Path) {
    let config = match TransportConfig::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load config: {error}");
            std::process::exit(1);
        }
    };
    dfl_transport::logging::init(&config.logging);
    info!(node_id = config.node_id, "starting peer");

    let keystore = match KeyStore::load(&config.pki_priv_path, &config.pki_pub_path) {
        Ok(keystore) => Arc::new(keystore),
        Err(error) => {
            error!(%error, "failed to load key store");
            std::process::exit(1);
        }
    };
    let self_private = match keystore.self_private() {
        Ok(private) => private,
        Err(error) => {
            error!(%error, "no private key for this node");
            std::process::exit(1);
        }
    };

    let params = SphinxParams::default();
    let codec = match PacketCodec::new(params, config.node_id, self_private) {
        Ok(codec) => Arc::new(codec),
        Err(error) => {
            error!(%error, "invalid sphinx parameters");
            std::process::exit(1);
        }
    };

    let metrics = Metrics::new(format!("node-{}", config.node_id), config.metrics.controller_url.clone());
    let session_switch = SessionSwitch::new(config.node_id, config.port, params.packet_len(), config.peer_table(), metrics.clone());
    let fragments = Arc::new(FragmentCache::new(metrics.clone(), config.resend_period));
    let mixer = Mixer::new(config.mixer_config(), session_switch.clone(), metrics.clone());

    let transport = Transport::new(
        config.clone(),
        codec,
        keystore,
        fragments,
        mixer.clone(),
        session_switch.clone(),
        metrics.clone(),
    );
    transport.install_cover_generator().await;

    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let accept_handle = tokio::spawn(session_switch.clone().run_accept_loop(inbound_tx));
    tokio::spawn(async move {
        match accept_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                error!(%error, "peer listener failed");
                std::process::exit(1);
            }
            Err(error) => {
                error!(%error, "peer listener task panicked");
                std::process::exit(1);
            }
        }
    });
    tokio::spawn(mixer.clone().run());

    let dispatch_transport = transport.clone();
    tokio::spawn(async move {
        while let Some((peer_id, frame)) = inbound_rx.recv().await {
            let transport = dispatch_transport.clone();
            tokio::spawn(async move {
                let _span = tracing::debug_span!("inbound", peer_id).entered();
                transport.dispatch_inbound(frame).await;
            });
        }
    });

    session_switch.connect_peers().await;

    let client = reqwest::Client::new();
    let handles = spawn_background_loops(transport.clone(), metrics, client, config.resend_period, config.metrics.push_interval);

    loop {
        if let Some(bytes) = transport.receive().await {
            info!(len = bytes.len(), "delivered fragment to application layer");
        } else {
            break;
        }
    }
    for handle in handles {
        handle.abort();
    }
}
