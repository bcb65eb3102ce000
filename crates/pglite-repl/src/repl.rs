//! Statement loop: read `;`-terminated statements, run them, print responses.

use std::future::Future;
use std::pin::Pin;

use pglite_runtime::{PgLite, PgLiteError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Typing this ends the session.
pub const EXIT_STATEMENT: &str = "exit;";

/// Anything that can run a statement and hand back raw response bytes.
pub trait Session {
    fn exec<'a>(
        &'a self,
        statement: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, PgLiteError>> + Send + 'a>>;
}

impl Session for PgLite {
    fn exec<'a>(
        &'a self,
        statement: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, PgLiteError>> + Send + 'a>> {
        Box::pin(PgLite::exec(self, statement))
    }
}

/// Why the loop stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Exit,
    EndOfInput,
}

/// Run statements from `input` until `exit;` or end of input.
///
/// Failed statements are logged and the loop carries on.
pub async fn run<S, R, W>(session: &S, mut input: R, out: &mut W) -> std::io::Result<Outcome>
where
    S: Session + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(statement) = read_statement(&mut input).await? else {
            return Ok(Outcome::EndOfInput);
        };
        if statement == EXIT_STATEMENT {
            return Ok(Outcome::Exit);
        }
        if statement.trim_end_matches(';').trim().is_empty() {
            continue;
        }
        execute(session, &statement, out).await?;
    }
}

/// Run every blank-line separated statement in `script`.
pub async fn run_script<S, W>(session: &S, script: &str, out: &mut W) -> std::io::Result<usize>
where
    S: Session + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut ran = 0;
    for statement in script_statements(script) {
        tracing::info!(statement, "Running script statement");
        execute(session, statement, out).await?;
        ran += 1;
    }
    Ok(ran)
}

async fn execute<S, W>(session: &S, statement: &str, out: &mut W) -> std::io::Result<()>
where
    S: Session + ?Sized,
    W: AsyncWrite + Unpin,
{
    match session.exec(statement).await {
        Ok(response) => {
            out.write_all(&response).await?;
            out.write_all(b"\n").await?;
            out.flush().await
        }
        Err(e) => {
            tracing::error!(statement, "Statement failed: {e}");
            Ok(())
        }
    }
}

/// Read up to and including the next `;`. Returns the trimmed statement, or
/// `None` once input is exhausted.
async fn read_statement<R>(input: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if input.read_until(b';', &mut buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf).trim().to_string()))
}

/// Split a script on blank lines, dropping empty chunks.
pub fn script_statements(script: &str) -> impl Iterator<Item = &str> {
    script
        .split("\n\n")
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
}
