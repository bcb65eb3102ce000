//! End-to-end session tests against an echo guest.
//!
//! The guest answers each request with the request text, which makes it easy
//! to attribute every response to exactly one request.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{EXIT_ONE, EXIT_ZERO, Fixture, RETURN, TRAP, echo_guest, ready_echo_session};
use pglite_runtime::provision::{URANDOM_FILE, URANDOM_LEN};
use pglite_runtime::{LifecycleState, PgLiteError};
use tokio_util::sync::CancellationToken;

// ── Startup ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_provisions_and_becomes_ready() {
    let (fixture, pg) = ready_echo_session().await;

    assert_eq!(pg.state(), LifecycleState::Ready);
    assert!(fixture.path("tmp/pglite/base/PG_VERSION").exists());
    assert_eq!(
        std::fs::read(fixture.path("dev").join(URANDOM_FILE)).unwrap().len(),
        URANDOM_LEN
    );
    assert!(pg.listen_addr().is_none());

    pg.close().await.unwrap();
}

#[tokio::test]
async fn any_exit_status_from_start_is_accepted() {
    for start in [EXIT_ONE, EXIT_ZERO, RETURN] {
        let fixture = Fixture::new(&echo_guest(start));
        let pg = fixture.session();
        let ready = pg.start(fixture.config()).await.unwrap();
        ready.await.unwrap();
        assert_eq!(pg.exec("select 1;").await.unwrap(), b"select 1;");
        pg.close().await.unwrap();
    }
}

#[tokio::test]
async fn trap_during_start_is_fatal() {
    let fixture = Fixture::new(&echo_guest(TRAP));
    let pg = fixture.session();

    let err = pg.start(fixture.config()).await.unwrap_err();
    assert!(matches!(err, PgLiteError::Instantiation(_)), "got {err:?}");
    assert_eq!(pg.state(), LifecycleState::Created);
}

#[tokio::test]
async fn failing_initdb_is_fatal() {
    let fixture = Fixture::new(&common::broken_initdb_guest());
    let pg = fixture.session();

    let err = pg.start(fixture.config()).await.unwrap_err();
    assert!(
        matches!(err, PgLiteError::GuestCall { entry: "pg_initdb", .. }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn invalid_image_fails_compilation() {
    let fixture = Fixture::new("this is not a guest image");
    let pg = fixture.session();

    let err = pg.start(fixture.config()).await.unwrap_err();
    assert!(matches!(err, PgLiteError::CompilationFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn second_start_is_rejected() {
    let (fixture, pg) = ready_echo_session().await;

    let err = pg.start(fixture.config()).await.unwrap_err();
    assert!(matches!(err, PgLiteError::AlreadyStarted(LifecycleState::Ready)));

    pg.close().await.unwrap();
}

#[tokio::test]
async fn readiness_fires_exactly_once() {
    let fixture = Fixture::new(&echo_guest(EXIT_ONE));
    let pg = fixture.session();
    let mut ready = pg.start(fixture.config()).await.unwrap();

    (&mut ready).await.unwrap();
    for i in 0..10 {
        pg.exec(&format!("select {i};")).await.unwrap();
    }
    assert!(ready.try_recv().is_err(), "readiness must not fire twice");

    pg.close().await.unwrap();
}

#[tokio::test]
async fn restart_reuses_extracted_filesystem() {
    let fixture = Fixture::new(&echo_guest(EXIT_ONE));

    let first = fixture.session();
    first.start(fixture.config()).await.unwrap().await.unwrap();
    first.close().await.unwrap();

    // The bundle is gone; the second session must not need it.
    std::fs::remove_file(&fixture.bundle_path).unwrap();

    let second = fixture.session();
    second.start(fixture.config()).await.unwrap().await.unwrap();
    assert_eq!(second.exec("select 2;").await.unwrap(), b"select 2;");
    second.close().await.unwrap();
}

#[tokio::test]
async fn compiled_guest_is_cached() {
    let fixture = Fixture::new(&echo_guest(EXIT_ONE));
    let cache_dir = fixture.path("cache");

    for _ in 0..2 {
        let pg = fixture.session();
        let cfg = fixture.config().with_cache_dir(&cache_dir);
        pg.start(cfg).await.unwrap().await.unwrap();
        assert_eq!(pg.exec("select 1;").await.unwrap(), b"select 1;");
        pg.close().await.unwrap();
    }

    let entries: Vec<_> = std::fs::read_dir(&cache_dir).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

// ── Message bridge ────────────────────────────────────────────────────────────

#[tokio::test]
async fn round_trip_returns_owned_responses() {
    let (_fixture, pg) = ready_echo_session().await;

    let first = pg.exec("select 1;").await.unwrap();
    let second = pg.exec("create table t(x int);").await.unwrap();
    let third = pg.exec("x").await.unwrap();

    // Later calls overwrite guest memory; earlier responses are unaffected.
    assert_eq!(first, b"select 1;");
    assert_eq!(second, b"create table t(x int);");
    assert_eq!(third, b"x");

    pg.close().await.unwrap();
}

#[tokio::test]
async fn terminated_and_unterminated_requests_match() {
    let (_fixture, pg) = ready_echo_session().await;

    let plain = pg.exec_protocol(b"select 1;").await.unwrap();
    let terminated = pg.exec_protocol(b"select 1;\0").await.unwrap();
    assert_eq!(plain, terminated);
    assert_eq!(plain, b"select 1;");

    pg.close().await.unwrap();
}

#[tokio::test]
async fn empty_request_yields_empty_response() {
    let (_fixture, pg) = ready_echo_session().await;
    assert!(pg.exec("").await.unwrap().is_empty());
    pg.close().await.unwrap();
}

#[tokio::test]
async fn request_larger_than_guest_memory_is_an_error() {
    let (_fixture, pg) = ready_echo_session().await;

    let huge = vec![b'a'; 128 * 1024];
    let err = pg.exec_protocol(&huge).await.unwrap_err();
    assert!(matches!(err, PgLiteError::Memory(_)), "got {err:?}");

    // The session survives.
    assert_eq!(pg.exec("select 1;").await.unwrap(), b"select 1;");
    pg.close().await.unwrap();
}

#[tokio::test]
async fn out_of_bounds_response_is_an_error_not_a_panic() {
    let fixture = Fixture::new(&common::oversized_response_guest());
    let pg = fixture.session();
    pg.start(fixture.config()).await.unwrap().await.unwrap();

    let err = pg.exec("select 1;").await.unwrap_err();
    assert!(matches!(err, PgLiteError::Memory(_)), "got {err:?}");
    assert!(pg.bridge().is_open().await);
    assert_eq!(pg.state(), LifecycleState::Ready);

    pg.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_serialized() {
    let (_fixture, pg) = ready_echo_session().await;
    let pg = Arc::new(pg);

    let mut handles = Vec::new();
    for i in 0..32 {
        let pg = Arc::clone(&pg);
        handles.push(tokio::spawn(async move {
            // Vary lengths so interleaved writes would leave visible debris.
            let query = format!("select {};", "x".repeat(i * 7));
            let response = pg.exec(&query).await.unwrap();
            (query, response)
        }));
    }

    for handle in handles {
        let (query, response) = handle.await.unwrap();
        assert_eq!(response, query.as_bytes());
    }

    pg.close().await.unwrap();
}

#[tokio::test]
async fn cancellation_before_the_guest_is_free() {
    let (_fixture, pg) = ready_echo_session().await;
    let token = CancellationToken::new();

    assert_eq!(
        pg.exec_cancellable(b"select 1;", &token).await.unwrap(),
        b"select 1;"
    );

    token.cancel();
    let err = pg.exec_cancellable(b"select 1;", &token).await.unwrap_err();
    assert!(matches!(err, PgLiteError::Cancelled));

    pg.close().await.unwrap();
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_releases_guest_and_rejects_further_requests() {
    let (_fixture, pg) = ready_echo_session().await;
    let bridge = pg.bridge();

    pg.close().await.unwrap();

    assert_eq!(pg.state(), LifecycleState::Closed);
    assert!(!bridge.is_open().await);
    assert!(matches!(pg.exec("select 1;").await, Err(PgLiteError::Closed)));
    assert!(matches!(bridge.exec("select 1;").await, Err(PgLiteError::Closed)));
}

#[tokio::test]
async fn close_is_idempotent() {
    let (_fixture, pg) = ready_echo_session().await;
    pg.close().await.unwrap();
    pg.close().await.unwrap();
    assert_eq!(pg.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn concurrent_closes_both_succeed() {
    let (_fixture, pg) = ready_echo_session().await;
    let (a, b) = tokio::join!(pg.close(), pg.close());
    a.unwrap();
    b.unwrap();
    assert_eq!(pg.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn dropping_the_session_releases_the_guest() {
    let (_fixture, pg) = ready_echo_session().await;
    let bridge = pg.bridge();
    drop(pg);

    tokio::time::timeout(Duration::from_secs(5), async {
        while bridge.is_open().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("guest should be released after the session is dropped");
}
