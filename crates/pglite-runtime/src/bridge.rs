//! Request/response handshake against guest linear memory.
//!
//! The guest has no structured API. A request is handed over by writing a
//! null-terminated message at [`REQUEST_OFFSET`] and calling
//! `interactive_one`. The guest leaves its answer at `msg_len + RESPONSE_GAP`,
//! where `msg_len` counts the terminator, and reports the answer's length from
//! `interactive_read`.
//!
//! ```text
//! offset 0     1                   msg_len+1   msg_len+2
//!        | rsv | request ...  \0  | -         | response ...
//! ```
//!
//! The gap is an ABI detail of the guest build, not something derived here.
//! A new guest binary may move it.

use std::borrow::Cow;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::PgLiteError;
use crate::guest::GuestInstance;

/// Requests are written here; offset 0 is reserved.
pub const REQUEST_OFFSET: usize = 1;
/// Distance from the terminated request length to the response start.
pub const RESPONSE_GAP: usize = 2;

/// Append the null terminator unless it is already there.
pub fn frame_request(message: &[u8]) -> Cow<'_, [u8]> {
    match message.last() {
        Some(0) => Cow::Borrowed(message),
        _ => {
            let mut framed = Vec::with_capacity(message.len() + 1);
            framed.extend_from_slice(message);
            framed.push(0);
            Cow::Owned(framed)
        }
    }
}

/// Where the guest puts the response for a terminated request of `msg_len` bytes.
pub fn response_offset(msg_len: usize) -> usize {
    msg_len + RESPONSE_GAP
}

/// Serialized access to the session's guest.
///
/// Cloning is cheap; every clone talks to the same guest. A single lock is held
/// for the whole write/call/read cycle, so concurrent callers never see each
/// other's bytes. Once the session is torn down every call fails with
/// [`PgLiteError::Closed`].
#[derive(Clone)]
pub struct MessageBridge {
    guest: Arc<Mutex<Option<GuestInstance>>>,
}

impl MessageBridge {
    pub(crate) fn new() -> Self {
        Self {
            guest: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) async fn install(&self, guest: GuestInstance) {
        *self.guest.lock().await = Some(guest);
    }

    /// Take the guest out, leaving the bridge closed.
    pub(crate) async fn release(&self) -> Option<GuestInstance> {
        self.guest.lock().await.take()
    }

    pub async fn is_open(&self) -> bool {
        self.guest.lock().await.is_some()
    }

    /// Run a query string through the guest.
    pub async fn exec(&self, query: &str) -> Result<Vec<u8>, PgLiteError> {
        self.exec_protocol(query.as_bytes()).await
    }

    /// Run raw message bytes through the guest and return an owned copy of
    /// its response.
    pub async fn exec_protocol(&self, message: &[u8]) -> Result<Vec<u8>, PgLiteError> {
        let mut guard = self.guest.lock().await;
        let guest = guard.as_mut().ok_or(PgLiteError::Closed)?;
        round_trip(guest, &frame_request(message)).await
    }

    /// Like [`exec_protocol`](Self::exec_protocol), giving up if `cancel`
    /// fires while waiting for the guest.
    ///
    /// A cycle that already started is always run to completion.
    pub async fn exec_cancellable(
        &self,
        message: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, PgLiteError> {
        let mut guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PgLiteError::Cancelled),
            guard = self.guest.lock() => guard,
        };
        let guest = guard.as_mut().ok_or(PgLiteError::Closed)?;
        round_trip(guest, &frame_request(message)).await
    }
}

async fn round_trip(guest: &mut GuestInstance, request: &[u8]) -> Result<Vec<u8>, PgLiteError> {
    let msg_len = request.len();
    guest.write_memory(REQUEST_OFFSET, request)?;

    guest.interactive_one().await?;

    let msg_start = response_offset(msg_len);
    let reported = guest.interactive_read().await?;
    let resp_len = usize::try_from(reported)
        .map_err(|_| PgLiteError::Memory(format!("guest reported response length {reported}")))?;

    let response = guest.read_memory(msg_start, resp_len)?;
    tracing::debug!(request_len = msg_len, response_len = resp_len, "Guest round trip");
    Ok(response)
}
