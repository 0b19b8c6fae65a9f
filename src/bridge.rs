//! Native messaging transport.
//!
//! The browser starts the host and exchanges frames over stdio: a 4-byte
//! little-endian length followed by that many bytes of UTF-8 JSON. Requests
//! may carry a `requestId` that is echoed on the matching response. Service
//! events are written as unsolicited frames.

use std::sync::Arc;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::service::{BackgroundService, Message};

const TARGET: &str = "native_host";
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(usize),
    #[error("stream closed in the middle of a frame")]
    Truncated,
    #[error("native messaging i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads one frame. `Ok(None)` means the peer closed the stream cleanly.
/// Oversized frames are skipped so the stream stays aligned.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(BridgeError::Truncated)
            };
        }
        filled += read;
    }

    let length = u32::from_le_bytes(header) as usize;
    if length > MAX_FRAME_BYTES {
        let skipped = tokio::io::copy(&mut reader.take(length as u64), &mut tokio::io::sink()).await?;
        if skipped < length as u64 {
            return Err(BridgeError::Truncated);
        }
        return Err(BridgeError::FrameTooLarge(length));
    }

    let mut body = BytesMut::zeroed(length);
    reader.read_exact(&mut body).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            BridgeError::Truncated
        } else {
            BridgeError::Io(err)
        }
    })?;
    Ok(Some(body.freeze()))
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(BridgeError::FrameTooLarge(body.len()));
    }

    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Serves requests from `reader` until EOF. The caller owns the service
/// shutdown.
pub async fn run<R, W>(service: Arc<BackgroundService>, mut reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel::<JsonValue>(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
    let forwarder = tokio::spawn(forward_events(service.subscribe_events(), outbound_tx.clone()));

    info!(target: TARGET, "native messaging host ready");
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!(target: TARGET, "stdin closed; stopping native host");
                break;
            }
            Err(BridgeError::FrameTooLarge(length)) => {
                warn!(target: TARGET, length, "rejected oversized frame");
                let reply = error_reply(None, &BridgeError::FrameTooLarge(length).to_string());
                if outbound_tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
            Err(err) => {
                warn!(target: TARGET, %err, "native messaging stream failed");
                break;
            }
        };

        let reply = handle_frame(&service, &frame).await;
        if outbound_tx.send(reply).await.is_err() {
            warn!(target: TARGET, "writer stopped; dropping remaining requests");
            break;
        }
    }

    forwarder.abort();
    drop(outbound_tx);
    if let Err(err) = writer_task.await {
        warn!(target: TARGET, %err, "native messaging writer task failed");
    }
    Ok(())
}

async fn handle_frame(service: &BackgroundService, frame: &[u8]) -> JsonValue {
    let value: JsonValue = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(err) => {
            warn!(target: TARGET, %err, "discarding undecodable frame");
            return error_reply(None, &BridgeError::Json(err).to_string());
        }
    };
    let request_id = value.get("requestId").cloned();

    let message = match serde_json::from_value::<Message>(value) {
        Ok(message) => message,
        Err(err) => {
            warn!(target: TARGET, %err, "rejected unknown or malformed message");
            return error_reply(request_id, &format!("unsupported message: {err}"));
        }
    };

    match service.handle_message(message).await {
        Ok(response) => match serde_json::to_value(&response) {
            Ok(mut encoded) => {
                if let (Some(id), JsonValue::Object(fields)) = (request_id, &mut encoded) {
                    fields.insert("requestId".into(), id);
                }
                encoded
            }
            Err(err) => error_reply(request_id, &format!("failed to encode response: {err}")),
        },
        Err(err) => {
            let message = format!("{err:#}");
            warn!(target: TARGET, error = %message, "message handling failed");
            error_reply(request_id, &message)
        }
    }
}

fn error_reply(request_id: Option<JsonValue>, message: &str) -> JsonValue {
    let mut reply = json!({ "error": message });
    if let (Some(id), JsonValue::Object(fields)) = (request_id, &mut reply) {
        fields.insert("requestId".into(), id);
    }
    reply
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<JsonValue>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(value) = outbound.recv().await {
        match write_frame(&mut writer, &value).await {
            Ok(()) => {}
            Err(BridgeError::FrameTooLarge(length)) => {
                warn!(target: TARGET, length, "outbound frame too large; not sent");
            }
            Err(err) => {
                warn!(target: TARGET, %err, "failed to write frame; closing writer");
                break;
            }
        }
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<crate::service::ServiceEvent>,
    outbound: mpsc::Sender<JsonValue>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let encoded = match serde_json::to_value(&event) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        warn!(target: TARGET, %err, "failed to encode service event");
                        continue;
                    }
                };
                debug!(target: TARGET, origin = event.origin(), "forwarding service event");
                if outbound.send(encoded).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: TARGET, skipped, "event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
