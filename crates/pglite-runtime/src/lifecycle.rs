use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wasmtime::Module;

use crate::bridge::MessageBridge;
use crate::config::Config;
use crate::error::PgLiteError;
use crate::guest::GuestInstance;
use crate::listener::NetworkFront;
use crate::provision::{AssetBundle, BundleProvisioner, Provisioner};
use crate::runtime_context::{RuntimeContext, image_digest};

/// Where a session is in its life.
///
/// `Created → Starting → Ready | Listening → Closing → Closed`. A session
/// with a network front goes straight from `Starting` to `Listening`. A failed
/// start falls back to `Created`; `Closed` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Ready,
    Listening,
    Closing,
    Closed,
}

/// Fires once, when the guest is initialized and the network front (if
/// enabled) is bound.
pub type ReadySignal = oneshot::Receiver<()>;

/// An embedded PGlite session.
///
/// `PgLite` owns the Wasmtime runtime, the single guest instance, and the
/// background task that tears the guest down when the session is closed.
///
/// # Threading
///
/// `PgLite` is `Send + Sync` and is typically wrapped in `Arc`. The guest is
/// not reentrant, so requests from every caller (including network
/// connections) are serialized through one [`MessageBridge`].
pub struct PgLite {
    runtime: Mutex<Option<Arc<RuntimeContext>>>,
    provisioner: Arc<dyn Provisioner>,
    bridge: MessageBridge,
    state: watch::Sender<LifecycleState>,
    /// Quit signal: consumed once by the teardown task.
    quit: CancellationToken,
    teardown: Mutex<Option<JoinHandle<Result<(), PgLiteError>>>>,
    listen_addr: OnceLock<SocketAddr>,
}

impl PgLite {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Result<Self, PgLiteError> {
        let runtime = Arc::new(RuntimeContext::new()?);
        let (state, _) = watch::channel(LifecycleState::Created);
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            provisioner,
            bridge: MessageBridge::new(),
            state,
            quit: CancellationToken::new(),
            teardown: Mutex::new(None),
            listen_addr: OnceLock::new(),
        })
    }

    /// Session backed by a tar.gz guest bundle.
    pub fn with_bundle(bundle: AssetBundle) -> Result<Self, PgLiteError> {
        Self::new(Arc::new(BundleProvisioner::new(bundle)))
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Handle for issuing requests, usable from other tasks.
    pub fn bridge(&self) -> MessageBridge {
        self.bridge.clone()
    }

    /// Address of the network front, once bound.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    /// Provision the guest filesystem, boot the guest, and start the network
    /// front if configured.
    ///
    /// Only valid once per session. On failure the session returns to
    /// [`LifecycleState::Created`] and may be started again.
    pub async fn start(&self, config: Config) -> Result<ReadySignal, PgLiteError> {
        let began = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Created {
                *state = LifecycleState::Starting;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(PgLiteError::AlreadyStarted(self.state()));
        }

        tracing::info!(
            tmp_dir = %config.tmp_dir().display(),
            dev_dir = %config.dev_dir().display(),
            user = config.user(),
            database = config.database(),
            "Starting PGlite session"
        );

        match self.boot(&config).await {
            Ok(ready) => Ok(ready),
            Err(e) => {
                tracing::warn!("PGlite session failed to start: {e}");
                self.state.send_replace(LifecycleState::Created);
                Err(e)
            }
        }
    }

    async fn boot(&self, config: &Config) -> Result<ReadySignal, PgLiteError> {
        let runtime = self
            .runtime
            .lock()
            .await
            .clone()
            .ok_or(PgLiteError::Closed)?;

        let module = self.prepare_module(&runtime, config).await?;
        let guest = GuestInstance::boot(&runtime, &module, config).await?;
        self.bridge.install(guest).await;
        tracing::info!("Guest ready");

        let (listener, serving) = match config.listen_addr() {
            Some(addr) => match NetworkFront::bind(addr, self.bridge.clone()).await {
                Ok(front) => {
                    if let Ok(bound) = front.local_addr() {
                        let _ = self.listen_addr.set(bound);
                    }
                    let task = tokio::spawn(front.serve(self.quit.child_token()));
                    (Some(task), LifecycleState::Listening)
                }
                Err(e) => {
                    self.bridge.release().await;
                    return Err(e);
                }
            },
            None => (None, LifecycleState::Ready),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let mut states = self.state.subscribe();
        let quit = self.quit.clone();
        let bridge = self.bridge.clone();
        let task = tokio::spawn(async move {
            if states.wait_for(|s| *s != LifecycleState::Starting).await.is_ok() {
                // The caller may have dropped its receiver; that is not our problem.
                let _ = ready_tx.send(());
            }
            quit.cancelled().await;
            teardown(bridge, listener).await
        });
        *self.teardown.lock().await = Some(task);

        // Published last: `close` waits out `Starting`, so it only ever sees a
        // session whose teardown task is already registered.
        self.state.send_replace(serving);

        Ok(ready_rx)
    }

    /// Run the provisioner and compile the guest image off the async workers.
    async fn prepare_module(
        &self,
        runtime: &Arc<RuntimeContext>,
        config: &Config,
    ) -> Result<Module, PgLiteError> {
        let provisioner = Arc::clone(&self.provisioner);
        let runtime = Arc::clone(runtime);
        let tmp_dir = config.tmp_dir().to_path_buf();
        let dev_dir = config.dev_dir().to_path_buf();
        let cache_dir = config.cache_dir().map(Path::to_path_buf);

        tokio::task::spawn_blocking(move || -> Result<Module, PgLiteError> {
            let image = provisioner.provision(&tmp_dir, &dev_dir)?;
            tracing::info!(
                bytes = image.len(),
                digest = %image_digest(&image),
                "Guest image provisioned"
            );
            runtime.compile(&image, cache_dir.as_deref())
        })
        .await
        .map_err(|e| PgLiteError::Instantiation(format!("provisioning task failed: {e}")))?
    }

    /// Run a query string through the guest.
    pub async fn exec(&self, query: &str) -> Result<Vec<u8>, PgLiteError> {
        self.exec_protocol(query.as_bytes()).await
    }

    /// Run raw message bytes through the guest.
    pub async fn exec_protocol(&self, message: &[u8]) -> Result<Vec<u8>, PgLiteError> {
        self.ensure_started()?;
        self.bridge.exec_protocol(message).await
    }

    /// Run raw message bytes through the guest unless `cancel` fires first.
    pub async fn exec_cancellable(
        &self,
        message: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, PgLiteError> {
        self.ensure_started()?;
        self.bridge.exec_cancellable(message, cancel).await
    }

    fn ensure_started(&self) -> Result<(), PgLiteError> {
        match self.state() {
            LifecycleState::Created | LifecycleState::Starting => Err(PgLiteError::NotStarted),
            _ => Ok(()),
        }
    }

    /// Shut the session down: fire the quit signal, wait for the guest to be
    /// released, and drop the runtime.
    ///
    /// Idempotent: once a close has begun, later calls wait for it to finish
    /// and return `Ok(())`.
    ///
    /// # Panics
    ///
    /// Panics if tearing down the guest fails. There is no usable state to
    /// return to at that point.
    pub async fn close(&self) -> Result<(), PgLiteError> {
        let mut watcher = self.state.subscribe();

        let from = loop {
            let mut observed = LifecycleState::Created;
            let mut claimed = None;
            self.state.send_if_modified(|state| {
                observed = *state;
                match state {
                    LifecycleState::Created | LifecycleState::Ready | LifecycleState::Listening => {
                        claimed = Some(*state);
                        *state = LifecycleState::Closing;
                        true
                    }
                    _ => false,
                }
            });

            if let Some(from) = claimed {
                break from;
            }
            match observed {
                LifecycleState::Starting => {
                    let _ = watcher.wait_for(|s| *s != LifecycleState::Starting).await;
                }
                _ => {
                    let _ = watcher.wait_for(|s| *s == LifecycleState::Closed).await;
                    return Ok(());
                }
            }
        };

        tracing::info!(from = ?from, "Closing PGlite session");
        self.quit.cancel();

        let task = self.teardown.lock().await.take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => panic!("guest teardown failed: {e}"),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => panic!("guest teardown task failed: {e}"),
            }
        }

        self.runtime.lock().await.take();
        self.state.send_replace(LifecycleState::Closed);
        tracing::info!("PGlite session closed");
        Ok(())
    }
}

impl Drop for PgLite {
    fn drop(&mut self) {
        // A session dropped without `close` still gets its guest released by
        // the teardown task.
        self.quit.cancel();
    }
}

/// Stop the network front and release the guest.
///
/// The guest is released even when the network front failed. Failures are
/// logged here as well as returned, since a dropped session never joins this.
async fn teardown(
    bridge: MessageBridge,
    listener: Option<JoinHandle<()>>,
) -> Result<(), PgLiteError> {
    let stopped = match listener {
        Some(listener) => listener
            .await
            .map_err(|e| PgLiteError::Listen(format!("network front task failed: {e}"))),
        None => Ok(()),
    };

    match bridge.release().await {
        Some(guest) => {
            drop(guest);
            tracing::debug!("Guest instance released");
        }
        None => tracing::debug!("Guest instance already released"),
    }

    if let Err(e) = &stopped {
        tracing::error!("Guest teardown failed: {e}");
    }
    stopped
}
