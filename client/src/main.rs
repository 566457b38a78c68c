use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use umbra_client::{
    AccessLedger, BridgeConfig, CryptoService, FileBlobStore, FileSystemProvider, ProxyConfig,
    SecureBytes, SecurityBridge, SecurityService, ServiceContainer, ServiceError, SocketProxy,
};
use umbra_common::{config::data_dir, AppCertPath};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "umbra")]
#[command(about = "Umbra client: talks to the privileged helper")]
struct Args {
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Helper socket path (defaults to $UMBRA_SOCKET_DIR/umbra-helper.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Use mutual TLS with certificates under $UMBRA_CERTS_DIR
    #[arg(long)]
    tls: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the helper answers
    Ping,
    /// Generate a key and print its identifier
    GenerateKey {
        /// Identifier to use instead of a generated one
        #[arg(long)]
        id: Option<String>,
        /// symmetric or signing
        #[arg(long, default_value = "symmetric")]
        key_type: String,
    },
    /// List key identifiers held by the helper
    ListKeys,
    /// Delete a key
    DeleteKey { id: String },
    /// Encrypt text, printing hex
    Encrypt { key: String, text: String },
    /// Decrypt hex produced by `encrypt`
    Decrypt { key: String, hex: String },
    /// Hash text, printing hex
    Hash {
        text: String,
        #[arg(long)]
        algorithm: Option<String>,
    },
    /// Print random bytes as hex
    Random { length: usize },
    /// Seal and store a repository credential
    StoreCredential { id: String, key: String, secret: String },
    /// Print a stored repository credential
    LoadCredential { id: String, key: String },
    /// Bookmark a path for later access
    Bookmark { path: PathBuf },
}

fn build_container(proxy_config: ProxyConfig) -> ServiceContainer {
    let data = data_dir();
    let container = ServiceContainer::new();

    container.register(move || {
        let proxy = SocketProxy::connect(&proxy_config).map_err(|e| ServiceError::Initialization {
            service: "crypto".into(),
            reason:  format!("{e:#}"),
        })?;
        Ok(CryptoService::new(SecurityBridge::new(Arc::new(proxy), BridgeConfig::new())))
    });

    let bookmarks = data.join("bookmarks");
    container.register(move || {
        Ok(AccessLedger::new(
            Arc::new(FileSystemProvider::new()),
            Arc::new(FileBlobStore::new(bookmarks.clone())),
        ))
    });

    let credentials = data.join("credentials");
    container.register(move || Ok(SecurityService::new(Arc::new(FileBlobStore::new(credentials.clone())))));

    container
}

async fn run(container: &ServiceContainer, command: Commands) -> Result<()> {
    match command {
        Commands::Ping => {
            container.resolve::<CryptoService>().await?;
            println!("Helper is reachable");
        }
        Commands::GenerateKey { id, key_type } => {
            let crypto = container.resolve::<CryptoService>().await?;
            println!("{}", crypto.generate_key(&key_type, id.as_deref()).await?);
        }
        Commands::ListKeys => {
            let crypto = container.resolve::<CryptoService>().await?;
            for id in crypto.list_key_identifiers().await? {
                println!("{id}");
            }
        }
        Commands::DeleteKey { id } => {
            let crypto = container.resolve::<CryptoService>().await?;
            crypto.delete_key(&id).await?;
        }
        Commands::Encrypt { key, text } => {
            let crypto = container.resolve::<CryptoService>().await?;
            let sealed = crypto.encrypt(&SecureBytes::from(text.as_str()), &key).await?;
            println!("{}", hex::encode(sealed.as_bytes()));
        }
        Commands::Decrypt { key, hex } => {
            let crypto = container.resolve::<CryptoService>().await?;
            let sealed = hex::decode(hex.trim()).context("Ciphertext is not valid hex")?;
            let plain = crypto.decrypt(&SecureBytes::new(sealed), &key).await?;
            println!("{}", String::from_utf8_lossy(plain.as_bytes()));
        }
        Commands::Hash { text, algorithm } => {
            let crypto = container.resolve::<CryptoService>().await?;
            let digest = crypto
                .hash(&SecureBytes::from(text.as_str()), algorithm.as_deref())
                .await?;
            println!("{}", hex::encode(digest.as_bytes()));
        }
        Commands::Random { length } => {
            let crypto = container.resolve::<CryptoService>().await?;
            let random = crypto.random_bytes(length).await?;
            tracing::info!("Random bytes from {:?} source", random.source);
            println!("{}", hex::encode(random.bytes.as_bytes()));
        }
        Commands::StoreCredential { id, key, secret } => {
            let secret = Zeroizing::new(secret);
            let security = container.resolve::<SecurityService>().await?;
            security
                .store_credential(&id, &SecureBytes::from(secret.as_str()), &key)
                .await?;
        }
        Commands::LoadCredential { id, key } => {
            let security = container.resolve::<SecurityService>().await?;
            let secret = security.load_credential(&id, &key).await?;
            println!("{}", String::from_utf8_lossy(secret.as_bytes()));
        }
        Commands::Bookmark { path } => {
            let ledger = container.resolve::<AccessLedger>().await?;
            let token = ledger.create_bookmark(&path).await?;
            println!("{}", hex::encode(token.as_bytes()));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut proxy_config = ProxyConfig::new();
    if let Some(socket) = args.socket {
        proxy_config = proxy_config.with_socket_path(socket);
    }
    if args.tls {
        proxy_config = proxy_config.with_tls(AppCertPath::new());
    }

    let container = build_container(proxy_config);
    let result = run(&container, args.command).await;

    if let Err(e) = container.shutdown_all().await {
        tracing::warn!("Shutdown incomplete: {}", e);
    }
    result
}
