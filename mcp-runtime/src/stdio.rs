//! stdio transport: newline-delimited JSON in both directions. A line
//! starting with `Content-Length:` switches to header-framed reading for
//! that message, and replies follow the framing the host last used.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use host_evals_core::features::FeatureRegistry;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::peer::OUTBOUND_QUEUE_CAPACITY;
use crate::rpc::{RpcError, error_response};
use crate::shutdown::shutdown_signal;
use crate::{HarnessConfig, McpHarness};

/// Largest message body accepted from the host, framed or not.
pub const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to read MCP message: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write MCP message: {0}")]
    Write(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    NewlineDelimited,
    ContentLength,
}

#[derive(Debug, PartialEq)]
pub enum Inbound {
    Message(Value, Framing),
    /// Bad framing, an oversized body, or bytes that are not JSON. The
    /// stream stays usable.
    ParseError(String),
}

enum Line {
    Eof,
    Text(String),
    TooLong,
}

/// Reads the next message; `None` on a clean EOF.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Inbound>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    read_message_with_limit(reader, MAX_MESSAGE_BYTES).await
}

pub async fn read_message_with_limit<R>(reader: &mut R, limit: u64) -> Result<Option<Inbound>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = match read_line(reader, limit).await? {
            Line::Eof => return Ok(None),
            Line::TooLong => {
                return Ok(Some(Inbound::ParseError(format!(
                    "line exceeds {limit} bytes"
                ))));
            }
            Line::Text(line) => line,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.to_ascii_lowercase().starts_with("content-length:") {
            let declared = parse_content_length(trimmed);
            skip_remaining_headers(reader, limit).await?;
            let Some(length) = declared else {
                return Ok(Some(Inbound::ParseError(format!(
                    "invalid header '{trimmed}'"
                ))));
            };
            if length > limit {
                tokio::io::copy(&mut (&mut *reader).take(length), &mut tokio::io::sink())
                    .await
                    .map_err(TransportError::Read)?;
                return Ok(Some(Inbound::ParseError(format!(
                    "body of {length} bytes exceeds {limit} bytes"
                ))));
            }
            let mut body = Vec::new();
            (&mut *reader)
                .take(length)
                .read_to_end(&mut body)
                .await
                .map_err(TransportError::Read)?;
            if (body.len() as u64) < length {
                return Err(TransportError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Unexpected EOF while reading MCP body",
                )));
            }
            return Ok(Some(decode(&body, Framing::ContentLength)));
        }

        return Ok(Some(decode(trimmed.as_bytes(), Framing::NewlineDelimited)));
    }
}

/// One `\n`-terminated line, at most `limit` bytes. The rest of an overlong
/// line is discarded.
async fn read_line<R>(reader: &mut R, limit: u64) -> Result<Line, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut bytes = Vec::new();
    let read = (&mut *reader)
        .take(limit.saturating_add(1))
        .read_until(b'\n', &mut bytes)
        .await
        .map_err(TransportError::Read)?;
    if read == 0 {
        return Ok(Line::Eof);
    }
    if bytes.len() as u64 > limit && bytes.last() != Some(&b'\n') {
        discard_line(reader).await?;
        return Ok(Line::TooLong);
    }
    Ok(Line::Text(String::from_utf8_lossy(&bytes).into_owned()))
}

async fn discard_line<R>(reader: &mut R) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (consumed, done) = {
            let buf = reader.fill_buf().await.map_err(TransportError::Read)?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|byte| *byte == b'\n') {
                Some(index) => (index + 1, true),
                None => (buf.len(), false),
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

fn parse_content_length(line: &str) -> Option<u64> {
    line.split_once(':')
        .and_then(|(_, right)| right.trim().parse::<u64>().ok())
}

async fn skip_remaining_headers<R>(reader: &mut R, limit: u64) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_line(reader, limit).await? {
            Line::Eof => {
                return Err(TransportError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Unexpected EOF while reading MCP headers",
                )));
            }
            Line::Text(line) if line.trim().is_empty() => return Ok(()),
            Line::Text(_) | Line::TooLong => {}
        }
    }
}

fn decode(bytes: &[u8], framing: Framing) -> Inbound {
    match serde_json::from_slice(bytes) {
        Ok(value) => Inbound::Message(value, framing),
        Err(err) => Inbound::ParseError(err.to_string()),
    }
}

pub async fn write_message<W>(writer: &mut W, value: &Value, framing: Framing) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        TransportError::Write(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        ))
    })?;
    match framing {
        Framing::NewlineDelimited => {
            writer.write_all(&body).await.map_err(TransportError::Write)?;
            writer.write_all(b"\n").await.map_err(TransportError::Write)?;
        }
        Framing::ContentLength => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                body.len()
            );
            writer
                .write_all(header.as_bytes())
                .await
                .map_err(TransportError::Write)?;
            writer.write_all(&body).await.map_err(TransportError::Write)?;
        }
    }
    writer.flush().await.map_err(TransportError::Write)
}

/// Runs one session over a byte stream pair until EOF or `shutdown` fires.
pub async fn serve_streams<R, W, F>(
    reader: R,
    mut writer: W,
    registry: Arc<FeatureRegistry>,
    config: &HarnessConfig,
    shutdown: F,
) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let span = tracing::info_span!("mcp_session", transport = "stdio");
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(OUTBOUND_QUEUE_CAPACITY);
    let harness = Arc::new(McpHarness::new(registry, config, span.clone(), outbound_tx.clone()));
    let content_length = Arc::new(AtomicBool::new(false));

    let writer_task = {
        let content_length = content_length.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let framing = if content_length.load(Ordering::Relaxed) {
                    Framing::ContentLength
                } else {
                    Framing::NewlineDelimited
                };
                write_message(&mut writer, &message, framing).await?;
            }
            Ok::<(), TransportError>(())
        })
    };

    tracing::info!(parent: &span, event = "session_opened", "stdio session opened");
    let mut handlers = JoinSet::new();
    let mut reader = reader;
    tokio::pin!(shutdown);

    let outcome = loop {
        let inbound = tokio::select! {
            inbound = read_message(&mut reader) => inbound,
            _ = &mut shutdown => break Ok(()),
        };
        let inbound = match inbound {
            Ok(Some(inbound)) => inbound,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        match inbound {
            Inbound::ParseError(detail) => {
                tracing::info!(parent: &span, event = "parse_error", detail = %detail, "Discarding malformed message");
                let _ = outbound_tx
                    .send(error_response(Value::Null, RpcError::parse_error("Parse error")))
                    .await;
            }
            Inbound::Message(message, framing) => {
                content_length.store(framing == Framing::ContentLength, Ordering::Relaxed);
                let harness = harness.clone();
                let outbound_tx = outbound_tx.clone();
                handlers.spawn(async move {
                    for response in harness.handle_incoming_message(message).await {
                        let _ = outbound_tx.send(response).await;
                    }
                });
            }
        }
        while handlers.try_join_next().is_some() {}
    };

    harness.close();
    while handlers.join_next().await.is_some() {}
    drop(harness);
    drop(outbound_tx);

    let written = match writer_task.await {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(parent: &span, event = "writer_task_failed", error = %err, "stdio writer task failed");
            Ok(())
        }
    };
    tracing::info!(parent: &span, event = "session_ended", "stdio session ended");
    outcome.and(written)
}

pub async fn serve_stdio(registry: Arc<FeatureRegistry>, config: &HarnessConfig) -> Result<(), TransportError> {
    let reader = BufReader::new(tokio::io::stdin());
    serve_streams(reader, tokio::io::stdout(), registry, config, shutdown_signal()).await
}
