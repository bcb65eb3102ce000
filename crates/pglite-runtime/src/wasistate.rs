use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::config::{Config, StdioSink};
use crate::error::PgLiteError;

/// argv seen by the guest: single-user mode against the `postgres` database.
pub const GUEST_ARGS: [&str; 2] = ["--single", "postgres"];
pub const GUEST_TMP_MOUNT: &str = "/tmp";
pub const GUEST_DEV_MOUNT: &str = "/dev";

/// Store data for the guest instance.
///
/// Unlike a per-call sandbox this state lives for the whole session: the
/// guest keeps its database open between requests.
///
/// Guest environment:
/// - argv [`GUEST_ARGS`]
/// - `ENVIRONMENT=wasi-embed`, `REPL=Y`, `PGUSER`, `PGDATABASE`
/// - `tmp_dir` mounted at `/tmp`, `dev_dir` mounted at `/dev`
/// - stdout/stderr per [`Config`]
pub struct GuestState {
    pub(crate) wasi: WasiP1Ctx,
}

impl GuestState {
    pub fn new(config: &Config) -> Result<Self, PgLiteError> {
        let mut builder = WasiCtxBuilder::new();
        builder
            .args(&GUEST_ARGS)
            .env("ENVIRONMENT", "wasi-embed")
            .env("REPL", "Y")
            .env("PGUSER", config.user())
            .env("PGDATABASE", config.database());

        match config.stdout() {
            StdioSink::Inherit => {
                builder.inherit_stdout();
            }
            StdioSink::Null => {}
            StdioSink::Capture(pipe) => {
                builder.stdout(pipe.clone());
            }
        }
        match config.stderr() {
            StdioSink::Inherit => {
                builder.inherit_stderr();
            }
            StdioSink::Null => {}
            StdioSink::Capture(pipe) => {
                builder.stderr(pipe.clone());
            }
        }

        for (host, guest) in [
            (config.tmp_dir(), GUEST_TMP_MOUNT),
            (config.dev_dir(), GUEST_DEV_MOUNT),
        ] {
            builder
                .preopened_dir(host, guest, DirPerms::all(), FilePerms::all())
                .map_err(|e| {
                    PgLiteError::Instantiation(format!(
                        "cannot mount {} at {guest}: {e}",
                        host.display()
                    ))
                })?;
        }

        Ok(Self {
            wasi: builder.build_p1(),
        })
    }
}
