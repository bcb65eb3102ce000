use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pglite_runtime::{AssetBundle, Config, PgLite};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt};

mod repl;

#[derive(Parser)]
#[command(
    name = "pglite",
    about = "PGlite REPL: runs the embedded Postgres WASI engine and feeds it statements"
)]
struct Cli {
    /// Config file (default: <config dir>/pglite/pglite.toml, if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest bundle (tar.gz); not needed once the temp dir is populated
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Host directory mounted at /tmp in the guest
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Host directory mounted at /dev in the guest
    #[arg(long)]
    dev_dir: Option<PathBuf>,

    /// Database user
    #[arg(long)]
    user: Option<String>,

    /// Database name
    #[arg(long)]
    database: Option<String>,

    /// Also accept raw requests on this TCP port (not the Postgres wire protocol)
    #[arg(long)]
    listen: Option<u16>,

    /// Where compiled guest modules are cached
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Run the blank-line separated statements in this file before reading stdin
    #[arg(long)]
    script: Option<PathBuf>,
}

impl Cli {
    fn resolve_config(&self) -> Result<Config> {
        let default_path = dirs::config_dir().map(|d| d.join("pglite").join("pglite.toml"));
        let mut config = match (&self.config, default_path) {
            (Some(path), _) => Config::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            (None, Some(path)) if path.exists() => Config::from_file(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            _ => Config::new(),
        };

        if let Some(dir) = &self.tmp_dir {
            config = config.with_tmp_dir(dir);
        }
        if let Some(dir) = &self.dev_dir {
            config = config.with_dev_dir(dir);
        }
        if let Some(user) = &self.user {
            config = config.with_user(user);
        }
        if let Some(database) = &self.database {
            config = config.with_database(database);
        }
        if let Some(port) = self.listen {
            config = config.with_listen(port);
        }
        match &self.cache_dir {
            Some(dir) => config = config.with_cache_dir(dir),
            None if config.cache_dir().is_none() => {
                if let Some(dir) = dirs::cache_dir() {
                    config = config.with_cache_dir(dir.join("pglite"));
                }
            }
            None => {}
        }

        Ok(config)
    }

    fn bundle(&self) -> AssetBundle {
        match &self.bundle {
            Some(path) => AssetBundle::File(path.clone()),
            None => AssetBundle::embedded(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only guest responses
    fmt()
        .with_env_filter(EnvFilter::from_env("PGLITE_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    let pg = PgLite::with_bundle(cli.bundle())?;
    let ready = pg.start(config).await.context("failed to start PGlite")?;
    ready.await.context("PGlite never signalled readiness")?;
    tracing::info!("PGlite is ready");

    let mut stdout = tokio::io::stdout();

    if let Some(script) = &cli.script {
        let text = tokio::fs::read_to_string(script)
            .await
            .with_context(|| format!("failed to read script {}", script.display()))?;
        let ran = repl::run_script(&pg, &text, &mut stdout).await?;
        tracing::info!(statements = ran, "Script finished");
    }

    let outcome = repl::run(&pg, BufReader::new(tokio::io::stdin()), &mut stdout).await?;
    tracing::info!(?outcome, "Input finished, shutting down");

    pg.close().await?;
    Ok(())
}
