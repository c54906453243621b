use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethers::signers::{LocalWallet, Signer};
use log::{debug, info, warn};
use std::fs;
use std::path::PathBuf;
use zkitter_node::{
    ethereum::{address_to_string, validate_private_key},
    types::SignatureProof,
    utils::unix_millis,
    verifier::verify_signature,
    Config, Envelope, Hash32, Identity, Message, MessageKind, Node, Proof,
};

/// Largest envelope file `inspect` and `run --ingest` will read.
const MAX_ENVELOPE_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Zkitter protocol node", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an anonymous identity, or show the commitment of an existing one.
    Identity {
        #[arg(long, env = "ZKITTER_IDENTITY")]
        secret: Option<String>,
    },
    /// Sign a message with a wallet and write its envelope as JSON.
    Sign {
        #[arg(short, long, env = "ZKITTER_PRIVATE_KEY")]
        private_key: String,

        #[arg(short, long)]
        content: String,

        /// `TYPE[:SUBTYPE]`, e.g. `post`, `post:repost`, `moderation:like`.
        #[arg(short, long, default_value = "post")]
        kind: String,

        #[arg(short, long)]
        reference: Option<String>,

        #[arg(short, long, default_value = "envelope.json")]
        output: PathBuf,
    },
    /// Decode an envelope file and check what can be checked offline.
    Inspect {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Write the default configuration.
    InitConfig {
        #[arg(short, long, default_value = "zkitter.toml")]
        output: PathBuf,
    },
    /// Run a node until interrupted.
    Run {
        #[arg(short, long, default_value = "zkitter.toml")]
        config: PathBuf,

        /// Envelope files to ingest at startup.
        #[arg(long)]
        ingest: Vec<PathBuf>,
    },
}

fn read_envelope(path: &PathBuf) -> Result<Envelope> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata of {}", path.display()))?;
    if metadata.len() > MAX_ENVELOPE_FILE_SIZE {
        return Err(anyhow::anyhow!(
            "Envelope file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_ENVELOPE_FILE_SIZE
        ));
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Envelope::decode(&bytes).with_context(|| format!("Invalid envelope in {}", path.display()))
}

fn identity(secret: Option<String>) -> Result<()> {
    let identity = match secret {
        Some(secret) => Identity::from_secret_hex(&secret).context("Failed to parse identity")?,
        None => {
            let identity = Identity::random(&mut rand::thread_rng());
            println!("Secret: {}", identity.to_secret_hex());
            identity
        }
    };
    println!("Commitment: {}", identity.commitment());
    Ok(())
}

async fn sign(
    private_key: String,
    content: String,
    kind: String,
    reference: Option<String>,
    output: PathBuf,
) -> Result<()> {
    validate_private_key(&private_key)?;
    let wallet: LocalWallet = private_key
        .trim()
        .parse()
        .context("Failed to parse private key")?;
    let creator = address_to_string(&wallet.address());
    info!("Signing as {}", creator);

    let kind: MessageKind = kind.parse()?;
    let reference = reference
        .map(|r| r.parse::<Hash32>())
        .transpose()
        .context("Invalid reference hash")?;
    let message = Message::new(kind, &creator, content, reference, unix_millis()?)?;
    let signature = wallet
        .sign_message(message.hash().as_bytes())
        .await
        .context("Failed to sign message")?;

    let envelope = Envelope::new(
        message,
        Proof::Signature(SignatureProof {
            signature: signature.to_string(),
            address: creator,
        }),
    );
    let json = serde_json::to_string_pretty(&envelope).context("Failed to serialize envelope")?;
    fs::write(&output, json)
        .with_context(|| format!("Failed to write envelope to {}", output.display()))?;

    println!("Message hash: {}", envelope.message.hash());
    println!("Envelope written to {}", output.display());
    Ok(())
}

fn inspect(file: PathBuf) -> Result<()> {
    let envelope = read_envelope(&file)?;
    let message = &envelope.message;

    println!("Message:");
    println!("  Hash: {}", message.hash());
    println!("  Kind: {:?}", message.kind());
    if message.is_anonymous() {
        println!("  Creator: (anonymous)");
    } else {
        println!("  Creator: {}", message.creator());
    }
    if let Some(reference) = message.reference() {
        println!("  Reference: {}", reference);
    }
    println!("  Created at: {}", message.created_at());
    println!("  Content: {}", message.content());

    match &envelope.proof {
        Proof::Signature(proof) => {
            let valid = verify_signature(message, proof);
            println!("Signature proof by {}: {}", proof.address, if valid { "valid" } else { "INVALID" });
            if !valid {
                return Err(anyhow::anyhow!("Signature does not match the message creator"));
            }
        }
        Proof::Group(proof) => {
            println!("Group proof:");
            println!("  Root: {}", proof.root);
            println!("  Nullifier: {}", proof.nullifier);
            println!("  External nullifier: {}", proof.external_nullifier);
            println!("  Proof size: {} bytes", proof.zk_proof.len());
            println!("Group proofs are checked against live group state by a running node.");
        }
    }
    Ok(())
}

fn init_config(output: PathBuf) -> Result<()> {
    if output.exists() {
        return Err(anyhow::anyhow!(
            "Refusing to overwrite existing config: {}",
            output.display()
        ));
    }
    Config::default().save_to_file(&output)?;
    println!("Default configuration written to {}", output.display());
    Ok(())
}

async fn run(config_path: PathBuf, ingest: Vec<PathBuf>) -> Result<()> {
    let config = if config_path.exists() {
        Config::load_from_file(&config_path)?
    } else {
        warn!(
            "Config file {} not found, using defaults",
            config_path.display()
        );
        Config::default()
    };
    debug!("Configuration: {:?}", config);

    let node = Node::initialize(config)
        .await
        .context("Failed to initialize node")?;

    let users = node.sync_users().await.context("Initial user sync failed")?;
    let report = node
        .sync_groups(None)
        .await
        .context("Initial group sync failed")?;
    info!("Initial sync: {} users, {}", users, report);

    for path in &ingest {
        let envelope = read_envelope(path)?;
        let (message, proof) = envelope.into_parts();
        let hash = message.hash();
        let outcome = node.insert(message, proof).await?;
        info!("Ingested {} from {}: {:?}", hash, path.display(), outcome);
    }

    node.start().await.context("Failed to start node")?;
    info!("Node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    node.shutdown().await.context("Failed to shut down cleanly")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match args.command {
        Command::Identity { secret } => identity(secret),
        Command::Sign {
            private_key,
            content,
            kind,
            reference,
            output,
        } => sign(private_key, content, kind, reference, output).await,
        Command::Inspect { file } => inspect(file),
        Command::InitConfig { output } => init_config(output),
        Command::Run { config, ingest } => run(config, ingest).await,
    }
}
