mod codec;
mod handler;
mod response;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::Manager;
use crate::locker::KeyedLocker;
use crate::processor::Processor;
use crate::resolver::PathResolver;
use crate::settings::Settings;

use handler::{RequestOutcome, Response};

/// Shared per-process handles, cloned into every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub resolver: Arc<PathResolver>,
    pub cache: Arc<Manager>,
    pub locks: Arc<KeyedLocker>,
    pub processor: Arc<Processor>,
}

/// Accepts connections until ctrl-c, then signals the sweeper to stop.
pub async fn run(app: AppContext, shutdown: watch::Sender<bool>) -> Result<()> {
    let bind_addr = app.settings.server.address();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "image variant server started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming connection");
                        continue;
                    }
                };
                debug!(peer = %peer, "accepted connection");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
                }
                let connection_app = app.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, connection_app).await {
                        debug!(peer = %peer, error = %err, "connection closed with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                let _ = shutdown.send(true);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let start = Instant::now();
        let head = match codec::read_request_head(&mut reader, peer).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                let message = err.to_string();
                if message.starts_with("timed out") {
                    debug!(peer = %peer, "client idle timeout");
                    break;
                }
                warn!(peer = %peer, error = %err, "invalid request");
                let _ = response::send_error(reader.get_mut(), StatusCode::BAD_REQUEST).await;
                break;
            }
        };
        let client_close = head.connection_close();

        // The pipeline runs in its own task so a panic surfaces as a
        // JoinError and is answered with a 500 instead of killing the
        // connection loop.
        let outcome = match tokio::spawn(handler::process(app.clone(), head)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(peer = %peer, error = %err, "request handler panicked");
                RequestOutcome::error(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };

        let status = outcome.status();
        let keep_alive = !client_close && !matches!(outcome.response, Response::Error { .. });
        let written = write_outcome(reader.get_mut(), &outcome.response, keep_alive).await;
        let elapsed = start.elapsed();
        match outcome.log {
            Some(info) => info.into_event(peer.ip(), elapsed).log(status),
            None => crate::metrics::record_request(status, false, elapsed),
        }
        written?;
        if !keep_alive {
            break;
        }
    }
    let _ = reader.get_mut().shutdown().await;
    Ok(())
}

async fn write_outcome<S>(stream: &mut S, response: &Response, keep_alive: bool) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    match response {
        Response::Full {
            content_type,
            etag,
            last_modified,
            body,
        } => {
            response::send_image(
                stream,
                body.as_slice(),
                content_type,
                etag,
                last_modified,
                keep_alive,
            )
            .await
        }
        Response::NotModified {
            etag,
            last_modified,
        } => response::send_not_modified(stream, etag, last_modified, keep_alive).await,
        Response::Error { status } => response::send_error(stream, *status).await,
    }
}
