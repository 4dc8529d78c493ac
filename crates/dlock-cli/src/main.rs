//! dlock command line
//!
//! `dlock counter` runs the shared-counter workload twice, first without any
//! lock and then guarded by the selected backend, and prints both totals.
//! Each task gets its own engine (and store session), standing in for a
//! separate process.

mod counter;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use dlock_core::{
    BackendKind, DEFAULT_CONFIG_FILE, DistributedLock, LockRouter, LockSettings, metrics,
};
use dlock_store::{ExpiringKeyStore, HierarchicalStore, MemoryKeyStore, MemoryTree};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dlock", version, about = "Distributed lock backends over shared stores")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long = "config", env = "DLOCK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Increment a shared counter from many tasks, without and then with the lock
    Counter(CounterArgs),
}

#[derive(Args, Debug)]
struct CounterArgs {
    /// Backend to lock with; defaults to `default_backend` from the config
    #[arg(short = 'b', long)]
    backend: Option<BackendKind>,

    /// Number of concurrent tasks
    #[arg(short = 't', long, default_value_t = 20)]
    tasks: usize,

    /// Increments per task
    #[arg(short = 'i', long, default_value_t = 5000)]
    increments: u64,

    /// Resource name to lock
    #[arg(short = 'n', long, default_value = "/sum-lock")]
    name: String,

    /// Use Redis for the lease backend instead of the in-memory store
    #[cfg(feature = "redis-backend")]
    #[arg(long)]
    redis_url: Option<String>,

    /// Use ZooKeeper for the queue backend instead of the in-memory store
    #[cfg(feature = "zookeeper-backend")]
    #[arg(long)]
    zk_connect: Option<String>,
}

/// Store handles for the simulated processes.
struct Stores {
    key_store: Arc<dyn ExpiringKeyStore>,
    tree: TreeSource,
}

enum TreeSource {
    Memory(MemoryTree),
    #[cfg(feature = "zookeeper-backend")]
    Zookeeper {
        connect: String,
        session_timeout: std::time::Duration,
    },
}

impl Stores {
    async fn new(args: &CounterArgs, settings: &LockSettings) -> anyhow::Result<Self> {
        #[cfg(feature = "redis-backend")]
        let key_store: Arc<dyn ExpiringKeyStore> = match &args.redis_url {
            Some(url) => {
                info!(url = %url, "Using Redis for the lease backend");
                Arc::new(dlock_store::RedisKeyStore::connect(url).await?)
            }
            None => Arc::new(MemoryKeyStore::new()),
        };
        #[cfg(not(feature = "redis-backend"))]
        let key_store: Arc<dyn ExpiringKeyStore> = Arc::new(MemoryKeyStore::new());

        #[cfg(feature = "zookeeper-backend")]
        let tree = match &args.zk_connect {
            Some(connect) => {
                info!(connect = %connect, "Using ZooKeeper for the queue backend");
                TreeSource::Zookeeper {
                    connect: connect.clone(),
                    session_timeout: settings.zookeeper.session_timeout(),
                }
            }
            None => TreeSource::Memory(MemoryTree::new()),
        };
        #[cfg(not(feature = "zookeeper-backend"))]
        let tree = {
            let _ = (args, settings);
            TreeSource::Memory(MemoryTree::new())
        };

        Ok(Self { key_store, tree })
    }

    /// A fresh session, as a separate process would have.
    async fn session(&self) -> anyhow::Result<Arc<dyn HierarchicalStore>> {
        match &self.tree {
            TreeSource::Memory(tree) => Ok(Arc::new(tree.session())),
            #[cfg(feature = "zookeeper-backend")]
            TreeSource::Zookeeper {
                connect,
                session_timeout,
            } => Ok(Arc::new(
                dlock_store::ZkStore::connect(connect, *session_timeout).await?,
            )),
        }
    }
}

async fn run_counter(args: CounterArgs, mut settings: LockSettings) -> anyhow::Result<()> {
    if let Some(backend) = args.backend {
        settings.default_backend = backend;
        settings.routes.clear();
    }
    let expected = (args.tasks as u64)
        .checked_mul(args.increments)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "{} tasks x {} increments overflows the counter",
                args.tasks,
                args.increments
            )
        })?;
    info!(
        backend = settings.default_backend.as_str(),
        tasks = args.tasks,
        increments = args.increments,
        name = %args.name,
        "Starting counter workload"
    );

    let unguarded = counter::run_unguarded(args.tasks, args.increments).await?;
    println!(
        "without lock: {} / {} ({} lost) in {:?}",
        unguarded.total,
        expected,
        expected - unguarded.total,
        unguarded.elapsed
    );

    let stores = Stores::new(&args, &settings).await?;
    let mut locks: Vec<Arc<dyn DistributedLock>> = Vec::with_capacity(args.tasks);
    for _ in 0..args.tasks {
        let router = LockRouter::from_settings(
            &settings,
            Some(stores.key_store.clone()),
            Some(stores.session().await?),
        )?;
        locks.push(Arc::new(router));
    }

    let guarded = counter::run_guarded(locks, &args.name, args.increments).await?;
    println!(
        "with {} lock: {} / {} ({} lost releases) in {:?}",
        settings.default_backend.as_str(),
        guarded.total,
        expected,
        guarded.lost_releases,
        guarded.elapsed
    );

    // The noop backend excludes nothing
    if settings.default_backend != BackendKind::Noop && guarded.total != expected {
        anyhow::bail!("guarded run lost {} updates", expected - guarded.total);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = LockSettings::load(&cli.config)?;
    let _logging_guard = logging::init_logging(&settings.logging)?;
    metrics::describe_metrics();
    info!(config = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Command::Counter(args) => run_counter(args, settings).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_counter_defaults() {
        let cli = Cli::parse_from(["dlock", "counter"]);
        let Command::Counter(args) = cli.command;
        assert_eq!(args.tasks, 20);
        assert_eq!(args.increments, 5000);
        assert_eq!(args.name, "/sum-lock");
        assert_eq!(args.backend, None);
    }

    #[test]
    fn test_counter_backend_flag() {
        let cli = Cli::parse_from(["dlock", "counter", "--backend", "queue", "-t", "4"]);
        let Command::Counter(args) = cli.command;
        assert_eq!(args.backend, Some(BackendKind::Queue));
        assert_eq!(args.tasks, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_counter_queue() {
        let cli = Cli::parse_from(["dlock", "counter", "--backend", "queue", "-t", "4", "-i", "20"]);
        let Command::Counter(args) = cli.command;
        run_counter(args, LockSettings::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_counter_rejects_overflowing_total() {
        let max = u64::MAX.to_string();
        let cli = Cli::parse_from(["dlock", "counter", "-t", "2", "-i", max.as_str()]);
        let Command::Counter(args) = cli.command;
        let err = run_counter(args, LockSettings::default()).await.unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_counter_noop() {
        let cli = Cli::parse_from(["dlock", "counter", "--backend", "noop", "-t", "2", "-i", "5"]);
        let Command::Counter(args) = cli.command;
        run_counter(args, LockSettings::default()).await.unwrap();
    }
}
