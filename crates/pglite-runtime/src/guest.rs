use wasmtime::{Instance, Memory, Module, Store, TypedFunc};

use crate::config::Config;
use crate::error::PgLiteError;
use crate::runtime_context::RuntimeContext;
use crate::wasistate::GuestState;

/// Guest exports the host relies on.
pub mod exports {
    pub const MEMORY: &str = "memory";
    pub const START: &str = "_start";
    pub const INITDB: &str = "pg_initdb";
    pub const USE_SOCKETFILE: &str = "use_socketfile";
    pub const INTERACTIVE_ONE: &str = "interactive_one";
    pub const INTERACTIVE_READ: &str = "interactive_read";
}

/// The single live guest instance of a session.
///
/// Owns the store (and with it the guest's linear memory) plus the entry
/// points used per request. Dropping it releases everything the guest holds.
pub struct GuestInstance {
    store: Store<GuestState>,
    memory: Memory,
    interactive_one: TypedFunc<(), ()>,
    interactive_read: TypedFunc<(), i32>,
}

impl GuestInstance {
    /// Instantiate the guest and run it up to the point where it accepts
    /// requests: `_start`, then `pg_initdb`, then `use_socketfile`.
    pub async fn boot(
        runtime: &RuntimeContext,
        module: &Module,
        config: &Config,
    ) -> Result<Self, PgLiteError> {
        let state = GuestState::new(config)?;
        let mut store = Store::new(&runtime.engine, state);

        let instance = runtime
            .linker
            .instantiate_async(&mut store, module)
            .await
            .map_err(|e| PgLiteError::Instantiation(e.to_string()))?;

        run_start(&mut store, &instance).await?;

        call_unit(&mut store, &instance, exports::INITDB).await?;
        tracing::debug!("Guest database initialized");

        call_unit(&mut store, &instance, exports::USE_SOCKETFILE).await?;
        tracing::debug!("Guest switched to socket-file mode");

        let memory = instance
            .get_memory(&mut store, exports::MEMORY)
            .ok_or(PgLiteError::MissingExport(exports::MEMORY))?;
        let interactive_one = instance
            .get_typed_func::<(), ()>(&mut store, exports::INTERACTIVE_ONE)
            .map_err(|_| PgLiteError::MissingExport(exports::INTERACTIVE_ONE))?;
        let interactive_read = instance
            .get_typed_func::<(), i32>(&mut store, exports::INTERACTIVE_READ)
            .map_err(|_| PgLiteError::MissingExport(exports::INTERACTIVE_READ))?;

        Ok(Self {
            store,
            memory,
            interactive_one,
            interactive_read,
        })
    }

    pub(crate) fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PgLiteError> {
        self.memory
            .write(&mut self.store, offset, bytes)
            .map_err(|e| PgLiteError::Memory(format!("write of {} bytes at {offset}: {e}", bytes.len())))
    }

    pub(crate) fn read_memory(&self, offset: usize, len: usize) -> Result<Vec<u8>, PgLiteError> {
        let size = self.memory_size();
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(PgLiteError::Memory(format!(
                "read of {len} bytes at {offset} exceeds guest memory ({size} bytes)"
            )));
        }

        let mut buf = vec![0u8; len];
        self.memory
            .read(&self.store, offset, &mut buf)
            .map_err(|e| PgLiteError::Memory(format!("read of {len} bytes at {offset}: {e}")))?;
        Ok(buf)
    }

    pub(crate) async fn interactive_one(&mut self) -> Result<(), PgLiteError> {
        self.interactive_one
            .call_async(&mut self.store, ())
            .await
            .map_err(|e| PgLiteError::guest_call(exports::INTERACTIVE_ONE, e))
    }

    pub(crate) async fn interactive_read(&mut self) -> Result<i32, PgLiteError> {
        self.interactive_read
            .call_async(&mut self.store, ())
            .await
            .map_err(|e| PgLiteError::guest_call(exports::INTERACTIVE_READ, e))
    }

    /// Size of the guest's linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }
}

/// Run the guest's `_start`.
///
/// The guest finishes its startup routine with `proc_exit`, leaving its
/// exports callable, so any exit status is expected here. Other failures are
/// fatal.
async fn run_start(store: &mut Store<GuestState>, instance: &Instance) -> Result<(), PgLiteError> {
    let Ok(start) = instance.get_typed_func::<(), ()>(&mut *store, exports::START) else {
        tracing::debug!("Guest has no _start export, skipping startup routine");
        return Ok(());
    };

    match start.call_async(&mut *store, ()).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
            Some(exit) => {
                tracing::info!(exit_code = exit.0, "Guest startup routine exited");
                Ok(())
            }
            None => Err(PgLiteError::Instantiation(format!("{}: {e}", exports::START))),
        },
    }
}

async fn call_unit(
    store: &mut Store<GuestState>,
    instance: &Instance,
    entry: &'static str,
) -> Result<(), PgLiteError> {
    let func = instance
        .get_typed_func::<(), ()>(&mut *store, entry)
        .map_err(|_| PgLiteError::MissingExport(entry))?;
    func.call_async(&mut *store, ())
        .await
        .map_err(|e| PgLiteError::guest_call(entry, e))
}
