use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};
use wasmtime::{Config, Engine, Linker, Module};

use crate::error::PgLiteError;
use crate::wasistate::GuestState;

const PRECOMPILED_EXT: &str = "cwasm";

/// Shared Wasmtime engine and linker.
///
/// One `RuntimeContext` backs a session. The linker is pre-configured with the
/// WASI preview 1 host functions the guest imports.
pub struct RuntimeContext {
    pub engine: Engine,
    pub linker: Linker<GuestState>,
}

impl RuntimeContext {
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);

        let engine = Engine::new(&config)?;
        let mut linker: Linker<GuestState> = Linker::new(&engine);

        // Wire WASI p1 host functions (filesystem, clocks, random, stdio, …)
        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, |state: &mut GuestState| {
            &mut state.wasi
        })?;

        tracing::debug!("RuntimeContext initialized (async + WASI p1)");

        Ok(Self { engine, linker })
    }

    /// Compile a guest image, going through the precompiled cache when one is
    /// configured.
    ///
    /// Cache layout under `cache_dir`: `{sha256(image)}.cwasm`.
    pub fn compile(&self, image: &[u8], cache_dir: Option<&Path>) -> Result<Module, PgLiteError> {
        let Some(cache_dir) = cache_dir else {
            return Module::new(&self.engine, image)
                .map_err(|e| PgLiteError::CompilationFailed(e.to_string()));
        };

        let digest = image_digest(image);
        let cwasm_path = cache_dir.join(format!("{digest}.{PRECOMPILED_EXT}"));

        if cwasm_path.exists() {
            match self.load_precompiled(&cwasm_path) {
                Ok(module) => {
                    tracing::debug!(digest, "Loaded guest from precompiled cache");
                    return Ok(module);
                }
                Err(e) => tracing::debug!(digest, "Precompiled cache invalid, recompiling: {e}"),
            }
        }

        let module = Module::new(&self.engine, image)
            .map_err(|e| PgLiteError::CompilationFailed(e.to_string()))?;

        match module.serialize() {
            Ok(serialized) => {
                if let Err(e) = std::fs::create_dir_all(cache_dir)
                    .and_then(|()| std::fs::write(&cwasm_path, serialized))
                {
                    tracing::warn!(path = %cwasm_path.display(), "Could not save precompiled guest: {e}");
                } else {
                    tracing::debug!(digest, "Saved precompiled cache");
                }
            }
            Err(e) => tracing::warn!("Could not serialize compiled guest: {e}"),
        }

        Ok(module)
    }

    fn load_precompiled(&self, path: &Path) -> Result<Module> {
        // SAFETY: cache entries are only written by `compile` above, with an
        // engine of the same configuration and Wasmtime version; Wasmtime
        // rejects artifacts from a mismatched version or configuration.
        unsafe { Module::deserialize_file(&self.engine, path) }
    }
}

/// Hex SHA-256 of a guest image; the cache key for compiled modules.
pub fn image_digest(image: &[u8]) -> String {
    hex::encode(Sha256::digest(image))
}
