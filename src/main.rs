use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use prometheus::Registry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use layerstore::archive::provider_from_config;
use layerstore::config::Config;
use layerstore::fs::{ItemStore, LayeredItemStore};
use layerstore::layer::{
    ArchiveMetrics, BackgroundLayerArchiver, ItemsMatchDbConsistencyChecker, LayerConsistencyChecker, LayerManager,
};
use layerstore::storage::{DatabasePool, LayerDatabase, SuffixContentManager};

#[derive(Debug, Parser)]
#[command(name = "layerstore")]
#[command(about = "Layered, archivable item store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = "")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Write a file to stdout
    Cat { path: String },
    /// Store stdin or a local file at PATH
    Put {
        path: String,
        from: Option<PathBuf>,
    },
    Mkdir { path: String },
    /// Move a local directory into the store
    Import { source: PathBuf, destination: String },
    /// Copy a directory out of the store
    Export { source: String, destination: PathBuf },
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    Rmdir { path: String },
    Mv { source: String, destination: String },
    /// Seal the top layer and start a new one
    Rotate,
    /// Compare storage with the index
    Check {
        #[arg(long)]
        layer: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "layerstore=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    let pool = DatabasePool::open(&config.database).await?;
    let database: Arc<dyn LayerDatabase> = Arc::new(pool.layer_database());

    let provider = provider_from_config(&config)?;
    let metrics = Arc::new(ArchiveMetrics::new(Arc::new(Registry::new()))?);
    let checker: Option<Arc<dyn LayerConsistencyChecker>> = if config.store.check_before_archive {
        Some(Arc::new(ItemsMatchDbConsistencyChecker::new(database.clone())))
    } else {
        None
    };
    let archiver = Arc::new(BackgroundLayerArchiver::new(checker, metrics));
    let manager = Arc::new(LayerManager::new(&config.store.staging_root, provider, archiver.clone()).await?);

    let store = LayeredItemStore::new(database, manager)
        .with_content_manager(Arc::new(SuffixContentManager::from_config(&config.content)));

    let result = run(&store, cli.cmd).await;

    archiver.shutdown().await;
    pool.close().await;
    result
}

async fn run(store: &LayeredItemStore, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Ls { path, recursive } => {
            let items = if recursive { store.list_recursive(&path).await? } else { store.list_directory(&path).await? };
            let mut out = io::stdout().lock();
            for item in items {
                let suffix = if item.is_directory() { "/" } else { "" };
                writeln!(out, "{}{}", item.path, suffix)?;
            }
        }
        Command::Cat { path } => {
            let mut reader = store.read_file(&path).await?;
            io::copy(&mut reader, &mut io::stdout().lock())?;
        }
        Command::Put { path, from } => {
            let content = match from {
                Some(file) => std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?,
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            store.write_file(&path, content).await?;
        }
        Command::Mkdir { path } => store.create_directory(&path).await?,
        Command::Import { source, destination } => store.move_directory_into(&source, &destination).await?,
        Command::Export { source, destination } => store.copy_directory_out_of(&source, &destination).await?,
        Command::Rm { paths } => store.delete_files(&paths).await?,
        Command::Rmdir { path } => store.delete_directory(&path).await?,
        Command::Mv { source, destination } => store.move_directory_internal(&source, &destination).await?,
        Command::Rotate => {
            let id = store.new_top_layer().await?;
            println!("{}", id);
        }
        Command::Check { layer } => {
            store.check_same_layers_on_storage_and_db().await?;
            if let Some(id) = layer {
                store.check_layer(id).await?;
            }
            println!("OK");
        }
    }
    Ok(())
}
