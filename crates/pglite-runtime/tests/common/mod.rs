//! Guest fixtures shared by the integration suites.
//!
//! The guests are small WebAssembly text modules implementing the same entry
//! points as the PGlite build. The echo guest answers every request with the
//! request text itself, placed where the real guest places its responses.

#![allow(dead_code)]

use std::path::PathBuf;

use flate2::Compression;
use flate2::write::GzEncoder;
use pglite_runtime::provision::{IMAGE_PATH, MARKER_PATH};
use pglite_runtime::{AssetBundle, Config, PgLite, StdioSink};
use tar::{EntryType, Header};
use tempfile::TempDir;

/// Exits with status 1 from `_start`, like the real guest.
pub const EXIT_ONE: &str = "(call $proc_exit (i32.const 1))";
pub const EXIT_ZERO: &str = "(call $proc_exit (i32.const 0))";
pub const RETURN: &str = "";
pub const TRAP: &str = "(unreachable)";

/// Echo guest with a custom `_start` body.
pub fn echo_guest(start_body: &str) -> String {
    guest(start_body, "(global.set $ready (i32.const 1))", "(global.get $resp_len)")
}

/// Echo guest whose `pg_initdb` traps.
pub fn broken_initdb_guest() -> String {
    guest(EXIT_ONE, "(unreachable)", "(global.get $resp_len)")
}

/// Guest that claims a response far larger than its memory.
pub fn oversized_response_guest() -> String {
    guest(
        EXIT_ONE,
        "(global.set $ready (i32.const 1))",
        "(i32.const 0x7fffffff)",
    )
}

fn guest(start_body: &str, initdb_body: &str, read_body: &str) -> String {
    format!(
        r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (global $ready (mut i32) (i32.const 0))
  (global $resp_len (mut i32) (i32.const 0))

  (func (export "_start")
    {start_body})

  (func (export "pg_initdb")
    {initdb_body})

  (func (export "use_socketfile"))

  ;; Request: bytes from offset 1 up to the first zero.
  ;; Response: the same bytes at (request length incl. terminator) + 2.
  (func (export "interactive_one")
    (local $end i32)
    (local $len i32)
    (if (i32.eqz (global.get $ready)) (then (unreachable)))
    (local.set $end (i32.const 1))
    (block $done
      (loop $scan
        (br_if $done (i32.eqz (i32.load8_u (local.get $end))))
        (local.set $end (i32.add (local.get $end) (i32.const 1)))
        (br $scan)))
    (local.set $len (i32.sub (local.get $end) (i32.const 1)))
    (memory.copy
      (i32.add (local.get $len) (i32.const 3))
      (i32.const 1)
      (local.get $len))
    (global.set $resp_len (local.get $len)))

  (func (export "interactive_read") (result i32)
    {read_body}))
"#
    )
}

/// tar.gz bundle laid out like the real one, with `image` as the guest binary.
pub fn bundle(image: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    for (kind, path, data) in [
        (EntryType::Directory, "pglite/base", &b""[..]),
        (EntryType::Regular, MARKER_PATH, &b"17\n"[..]),
        (EntryType::Directory, "pglite/bin", &b""[..]),
        (EntryType::Regular, IMAGE_PATH, image),
    ] {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(if kind.is_dir() { 0o755 } else { 0o644 });
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, path, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Session fixture: a temp root, a bundle file on disk, and a quiet config.
pub struct Fixture {
    pub root: TempDir,
    pub bundle_path: PathBuf,
}

impl Fixture {
    pub fn new(guest_wat: &str) -> Self {
        let root = TempDir::new().unwrap();
        let bundle_path = root.path().join("pglite-wasi.tar.gz");
        std::fs::write(&bundle_path, bundle(guest_wat.as_bytes())).unwrap();
        Self { root, bundle_path }
    }

    pub fn config(&self) -> Config {
        Config::new()
            .with_tmp_dir(self.root.path().join("tmp"))
            .with_dev_dir(self.root.path().join("dev"))
            .with_stdout(StdioSink::Null)
            .with_stderr(StdioSink::Null)
    }

    pub fn session(&self) -> PgLite {
        PgLite::with_bundle(AssetBundle::File(self.bundle_path.clone())).unwrap()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }
}

/// Start an echo session and wait until it is ready.
pub async fn ready_echo_session() -> (Fixture, PgLite) {
    let fixture = Fixture::new(&echo_guest(EXIT_ONE));
    let pg = fixture.session();
    let ready = pg.start(fixture.config()).await.unwrap();
    ready.await.unwrap();
    (fixture, pg)
}
