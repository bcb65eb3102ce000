//! Host bridge for the PGlite WASI database engine.
//!
//! Runs a PostgreSQL build compiled to `wasm32-wasip1` inside Wasmtime and
//! exposes it as a request/response service. [`PgLite`] is the single entry
//! point: it provisions the guest filesystem, boots the guest, and serializes
//! every request through the [`MessageBridge`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use pglite_runtime::{AssetBundle, Config, PgLite};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let pg = PgLite::with_bundle(AssetBundle::File("pglite-wasi.tar.gz".into()))?;
//!
//! let ready = pg.start(Config::new().with_tmp_dir("./tmp")).await?;
//! ready.await?;
//!
//! let response = pg.exec("select 1;").await?;
//! println!("{}", String::from_utf8_lossy(&response));
//!
//! pg.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod guest;
pub mod lifecycle;
pub mod listener;
pub mod provision;
pub mod runtime_context;
pub mod wasistate;

pub use bridge::MessageBridge;
pub use config::{Config, ConfigFile, StdioSink};
pub use error::{PgLiteError, ProvisionError};
pub use lifecycle::{LifecycleState, PgLite, ReadySignal};
pub use provision::{AssetBundle, BundleProvisioner, Provisioner};
