use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use secp256kfun::Scalar;
use tracing::info;

use storeman_mpc::config::{GroupEntry, MemberConfig};
use storeman_mpc::crypto::{address_of, Provenance};
use storeman_mpc::logging::init_logging;
use storeman_mpc::{
    Distributor, GroupConfig, GroupDirectory, LocalNetwork, MemoryApprovalStore, MpcConfig,
    NodeId, Presets,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs key generation and signing across an in-process storeman group", long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 4)]
    nodes: usize,

    #[arg(short, long, default_value_t = 3)]
    threshold: usize,

    #[arg(short, long, default_value = "transfer 10")]
    message: String,

    #[arg(short = 'c', long = "sign-count", default_value_t = 1)]
    sign_count: usize,

    #[arg(long, help = "Engine settings, JSON")]
    config: Option<PathBuf>,

    #[arg(long, help = "Write the generated group configuration here")]
    group_out: Option<PathBuf>,

    #[arg(long, help = "Log as JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.json);

    let config = match &args.config {
        Some(path) => MpcConfig::from_file(path)?,
        None => MpcConfig::default(),
    };

    let provenance = Provenance::default();
    let mut rng = rand::thread_rng();
    let secrets: Vec<Scalar> = (0..args.nodes).map(|_| Scalar::random(&mut rng)).collect();
    let members = secrets
        .iter()
        .enumerate()
        .map(|(i, secret)| MemberConfig {
            index: i as u16,
            node_id: format!("storeman{i}"),
            public_key: hex::encode(provenance.public_key(secret).to_xonly_bytes()),
            public_share: None,
        })
        .collect();
    let group_config = GroupConfig {
        groups: vec![GroupEntry {
            id: "demo".into(),
            threshold: args.threshold,
            leader_index: 0,
            members,
        }],
    };
    if let Some(path) = &args.group_out {
        group_config.to_file(path)?;
    }

    let network = LocalNetwork::new();
    let mut nodes = vec![];
    for (i, secret) in secrets.into_iter().enumerate() {
        let directory = GroupDirectory::new(&group_config, NodeId::new(format!("storeman{i}")), secret)?;
        let node = Distributor::new(
            Arc::new(directory),
            config.clone(),
            network.clone(),
            Arc::new(MemoryApprovalStore::new()),
        );
        network.register(&node);
        nodes.push(node);
    }
    for node in &nodes {
        node.add_valid_data(args.message.as_bytes())?;
    }

    let mut followers: Vec<_> = nodes[1..].iter().map(|node| node.subscribe()).collect();
    let leader = &nodes[0];
    let gpk = leader
        .request_key_generation("demo", Presets::default())
        .await?;
    // followers store their key share on their own tasks
    for outcomes in &mut followers {
        let outcome = outcomes.recv().await?;
        if let Err(err) = outcome.result {
            return Err(err.into());
        }
    }
    info!(gpk = %hex::encode(&gpk), "group key generated");
    println!("gpk:     {}", hex::encode(&gpk));
    println!("address: {}", hex::encode(address_of(&gpk)));

    let presets = Presets {
        sign_count: args.sign_count,
        ..Presets::default()
    };
    let signatures = leader
        .request_signing(&gpk, args.message.as_bytes(), presets)
        .await?;
    for (k, signature) in signatures.iter().enumerate() {
        let valid = signature.verify(&gpk, args.message.as_bytes());
        println!(
            "sig[{k}]: r={} s={} v={} valid={valid}",
            hex::encode(&signature.r),
            hex::encode(&signature.s),
            signature.v
        );
    }

    Ok(())
}
