//! Local demo harness for the encrypting-gateway core: runs the same
//! encrypt/decrypt paths the S3 protocol layer would, against files on disk
//! instead of object-store requests.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY};
use s3ep_core::config::CoreConfig;
use s3ep_core::orchestrator::Orchestrator;
use s3ep_core::MetadataDict;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "s3ep", about = "Encrypting-gateway core demo harness", version)]
struct Cli {
    /// Path to a JSON config file matching the core's configuration surface.
    #[arg(long, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt a file, writing ciphertext and a metadata sidecar next to it.
    Encrypt {
        object_key: String,
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Decrypt a file produced by `encrypt`, given its metadata sidecar.
    Decrypt {
        object_key: String,
        input: PathBuf,
        #[arg(long)]
        metadata: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// List configured KEK provider aliases and the active one.
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    let config_text = tokio::fs::read_to_string(&cli.config)
        .await
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config = CoreConfig::from_json(&config_text).context("parsing config")?;
    let orchestrator = Orchestrator::new(config).context("constructing orchestrator")?;

    match cli.command {
        Command::Encrypt { object_key, input, output } => encrypt(&orchestrator, &object_key, &input, &output).await,
        Command::Decrypt {
            object_key,
            input,
            metadata,
            output,
        } => decrypt(&orchestrator, &object_key, &input, &metadata, &output).await,
        Command::Providers => {
            println!("active: {}", orchestrator.active_provider_alias());
            for alias in orchestrator.provider_aliases() {
                println!("configured: {alias}");
            }
            Ok(())
        }
    }
}

async fn encrypt(orchestrator: &Orchestrator, object_key: &str, input: &PathBuf, output: &PathBuf) -> Result<()> {
    let plaintext = tokio::fs::read(input).await.with_context(|| format!("reading {}", input.display()))?;
    let (ciphertext, wrapped_dek, metadata) = orchestrator.encrypt_bytes(object_key, &plaintext, None)?;

    tokio::fs::write(output, &ciphertext)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    let sidecar = sidecar_path(output);
    let sidecar_json = serde_json::to_string_pretty(&SidecarMetadata {
        wrapped_dek: BASE64.encode(&wrapped_dek),
        metadata,
    })?;
    tokio::fs::write(&sidecar, sidecar_json)
        .await
        .with_context(|| format!("writing {}", sidecar.display()))?;

    println!(
        "encrypted {} ({}) -> {} (+{})",
        input.display(),
        format_size(plaintext.len(), BINARY),
        output.display(),
        sidecar.display()
    );
    Ok(())
}

async fn decrypt(orchestrator: &Orchestrator, object_key: &str, input: &PathBuf, metadata_path: &PathBuf, output: &PathBuf) -> Result<()> {
    let ciphertext = tokio::fs::read(input).await.with_context(|| format!("reading {}", input.display()))?;
    let sidecar_json = tokio::fs::read_to_string(metadata_path)
        .await
        .with_context(|| format!("reading {}", metadata_path.display()))?;
    let sidecar: SidecarMetadata = serde_json::from_str(&sidecar_json).context("parsing metadata sidecar")?;
    let wrapped_dek = BASE64.decode(&sidecar.wrapped_dek).map_err(|e| anyhow!("invalid wrapped-dek base64: {e}"))?;

    let plaintext = orchestrator.decrypt_bytes(&ciphertext, &wrapped_dek, &sidecar.metadata, object_key)?;
    tokio::fs::write(output, &plaintext)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    println!("decrypted {} -> {} ({})", input.display(), output.display(), format_size(plaintext.len(), BINARY));
    Ok(())
}

fn sidecar_path(output: &PathBuf) -> PathBuf {
    let mut sidecar = output.clone();
    let name = sidecar.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    sidecar.set_file_name(format!("{name}.meta.json"));
    sidecar
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SidecarMetadata {
    wrapped_dek: String,
    metadata: MetadataDict,
}
