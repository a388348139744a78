use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use http::{Method, StatusCode};
use time::OffsetDateTime;
use tokio::task;
use tracing::debug;

use crate::logging::AccessLogEvent;
use crate::processor::{EncodeOptions, Format};

use super::AppContext;
use super::codec::RequestHead;
use super::response;

const RESIZE_PREFIX: &str = "/resize/";

/// Everything the transport needs to emit one response.
pub(super) struct RequestOutcome {
    pub response: Response,
    pub log: Option<AccessInfo>,
}

pub(super) enum Response {
    Full {
        content_type: &'static str,
        etag: String,
        last_modified: String,
        body: Body,
    },
    NotModified {
        etag: String,
        last_modified: String,
    },
    Error {
        status: StatusCode,
    },
}

pub(super) enum Body {
    Shared(Arc<[u8]>),
    Owned(Vec<u8>),
}

impl Body {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Body::Shared(bytes) => bytes,
            Body::Owned(bytes) => bytes,
        }
    }
}

impl RequestOutcome {
    pub fn status(&self) -> StatusCode {
        match &self.response {
            Response::Full { .. } => StatusCode::OK,
            Response::NotModified { .. } => StatusCode::NOT_MODIFIED,
            Response::Error { status } => *status,
        }
    }

    pub(super) fn error(status: StatusCode) -> Self {
        Self {
            response: Response::Error { status },
            log: None,
        }
    }
}

/// Per-request fields for the access log, completed by the transport once
/// the response has been written.
pub(super) struct AccessInfo {
    pub width: u32,
    pub height: u32,
    pub path: String,
    pub cached: bool,
    pub origin_mtime: Option<SystemTime>,
}

impl AccessInfo {
    pub fn into_event(self, client_ip: IpAddr, elapsed: Duration) -> AccessLogEvent {
        AccessLogEvent {
            client_ip,
            width: self.width,
            height: self.height,
            path: self.path,
            cached: self.cached,
            elapsed,
            origin_mtime: self.origin_mtime.map(OffsetDateTime::from),
        }
    }
}

struct SourceCandidate {
    relative: String,
    cache_suffix: String,
}

/// Runs the resize pipeline for one request and returns the response to
/// emit. Never writes to the socket itself.
pub(super) async fn process(app: AppContext, head: RequestHead) -> RequestOutcome {
    let Some((geometry, raw_path)) = route(&head) else {
        return request_error(StatusCode::NOT_FOUND, anyhow!("no such route"), "", &head.target);
    };

    let (width, height) = match parse_geometry(&geometry) {
        Ok(pair) => pair,
        Err(err) => return request_error(StatusCode::BAD_REQUEST, err, &geometry, &raw_path),
    };
    if let Err(err) = validate_dimensions(width, height, &app) {
        return request_error(StatusCode::BAD_REQUEST, err, &geometry, &raw_path);
    }

    let mut relative = raw_path.clone();
    if relative.contains("%20") {
        relative = relative.replace("%20", " ");
    }
    let relative = relative.trim_start_matches('/').to_string();
    if relative.trim().is_empty() {
        return request_error(
            StatusCode::BAD_REQUEST,
            anyhow!("path is required"),
            &geometry,
            &raw_path,
        );
    }

    let raw_ext = extension_of(&relative).unwrap_or_default();
    let Some(format) = Format::from_extension(&raw_ext) else {
        return request_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            anyhow!("unsupported extension \".{}\"", raw_ext.to_ascii_lowercase()),
            &geometry,
            &raw_path,
        );
    };

    let candidates = build_source_candidates(&relative, &raw_ext);
    let mut chosen: Option<(String, PathBuf, std::fs::Metadata)> = None;
    let mut ensure_opaque = false;
    let mut last_clean = relative.clone();
    for (index, candidate) in candidates.iter().enumerate() {
        let (clean, absolute) = match app.resolver.resolve(&candidate.relative) {
            Ok(pair) => pair,
            Err(err) => return request_error(StatusCode::BAD_REQUEST, err, &geometry, &raw_path),
        };
        match std::fs::metadata(&absolute) {
            Ok(info) => {
                let mut cache_rel = clean.clone();
                cache_rel.push_str(&candidate.cache_suffix);
                ensure_opaque = has_jpeg_extension(&clean);
                chosen = Some((cache_rel, absolute, info));
                break;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                last_clean = clean;
                if index == candidates.len() - 1 {
                    return request_error(
                        StatusCode::NOT_FOUND,
                        anyhow!("original not found: {last_clean}"),
                        &geometry,
                        &raw_path,
                    );
                }
            }
            Err(err) => {
                return request_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    anyhow!(err).context("stat original"),
                    &geometry,
                    &raw_path,
                );
            }
        }
    }
    let Some((cache_rel, original_path, original_info)) = chosen else {
        return request_error(
            StatusCode::NOT_FOUND,
            anyhow!("original not found: {last_clean}"),
            &geometry,
            &raw_path,
        );
    };

    let origin_mtime = original_info.modified().ok();
    let cache_path = app.resolver.cache_path(width, height, &cache_rel);
    let access = AccessInfo {
        width,
        height,
        path: cache_rel.clone(),
        cached: true,
        origin_mtime,
    };

    // Fast probe: memory tier first, then the disk tier.
    if let Some(hit) = app.cache.load_memory(&cache_path, origin_mtime) {
        crate::metrics::record_cache_lookup(true);
        return serve(&head, format, Body::Shared(hit.payload), hit.mtime, access);
    }
    if app.cache.is_fresh(&cache_path, origin_mtime) {
        match read_cached(&app, &cache_path).await {
            Ok((payload, mtime)) => {
                app.cache.mark_hot(&cache_path, payload.len() as u64);
                crate::metrics::record_cache_lookup(true);
                return serve(&head, format, Body::Owned(payload), mtime, access);
            }
            Err(err) => {
                debug!(path = %cache_path.display(), error = %err, "fresh cache entry unreadable, rebuilding");
            }
        }
    }
    crate::metrics::record_cache_lookup(false);

    // Build under the per-key lock; the double-checked probe lets waiters
    // serve the variant a concurrent builder just wrote.
    let _guard = app.locks.lock(&cache_path.to_string_lossy()).await;
    if let Some(hit) = app.cache.load_memory(&cache_path, origin_mtime) {
        return serve(&head, format, Body::Shared(hit.payload), hit.mtime, access);
    }
    if app.cache.is_fresh(&cache_path, origin_mtime)
        && let Ok((payload, mtime)) = read_cached(&app, &cache_path).await
    {
        app.cache.mark_hot(&cache_path, payload.len() as u64);
        return serve(&head, format, Body::Owned(payload), mtime, access);
    }

    let opts = EncodeOptions {
        width,
        height,
        format,
        jpg_quality: app.settings.resize.jpg_quality,
        webp_quality: app.settings.resize.webp_quality,
        avif_quality: app.settings.resize.avif_quality,
        avif_speed: app.settings.resize.avif_speed,
        png_compression: app.settings.resize.png_compression,
        ensure_opaque,
    };
    let build = {
        let cache = app.cache.clone();
        let processor = app.processor.clone();
        let cache_path = cache_path.clone();
        task::spawn_blocking(move || -> Result<(Vec<u8>, SystemTime)> {
            let source = std::fs::read(&original_path).context("read original")?;
            let payload = processor.encode(&source, &opts)?;
            cache.write(&cache_path, &payload).context("store cache")?;
            cache
                .read_cached(&cache_path)
                .context("unable to open cached file")
        })
        .await
    };
    let (payload, mtime) = match build {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            return request_error(StatusCode::INTERNAL_SERVER_ERROR, err, &geometry, &raw_path);
        }
        Err(err) => {
            return request_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                anyhow!(err).context("build task failed"),
                &geometry,
                &raw_path,
            );
        }
    };

    let access = AccessInfo {
        cached: false,
        path: cache_rel,
        ..access
    };
    serve(&head, format, Body::Owned(payload), mtime, access)
}

/// Evaluates the conditional headers against the payload about to be served;
/// `If-None-Match` takes precedence over `If-Modified-Since`.
fn serve(
    head: &RequestHead,
    format: Format,
    body: Body,
    mtime: SystemTime,
    access: AccessInfo,
) -> RequestOutcome {
    let etag = response::build_etag(body.as_slice());
    let last_modified = response::http_date(mtime);

    if let Some(candidates) = head.header("if-none-match")
        && response::etag_matches(candidates, &etag)
    {
        return RequestOutcome {
            response: Response::NotModified {
                etag,
                last_modified,
            },
            log: Some(access),
        };
    }
    if let Some(raw) = head.header("if-modified-since")
        && let Some(since) = response::parse_http_date(raw)
        && response::truncate_to_seconds(mtime) <= since
    {
        return RequestOutcome {
            response: Response::NotModified {
                etag,
                last_modified,
            },
            log: Some(access),
        };
    }

    RequestOutcome {
        response: Response::Full {
            content_type: format.content_type(),
            etag,
            last_modified,
            body,
        },
        log: Some(access),
    }
}

fn route(head: &RequestHead) -> Option<(String, String)> {
    if head.method != Method::GET {
        return None;
    }
    let path = head.target.split(['?', '#']).next().unwrap_or("");
    let rest = path.strip_prefix(RESIZE_PREFIX)?;
    let (geometry, file_path) = rest.split_once('/')?;
    Some((geometry.to_string(), file_path.to_string()))
}

fn parse_geometry(geometry: &str) -> Result<(u32, u32)> {
    let (raw_width, raw_height) = geometry
        .split_once('x')
        .ok_or_else(|| anyhow!("invalid geometry \"{geometry}\""))?;
    let width = parse_dimension(raw_width).context("invalid width")?;
    let height = parse_dimension(raw_height).context("invalid height")?;
    Ok((width, height))
}

fn parse_dimension(raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse()
        .map_err(|err| anyhow!("parse dimension \"{trimmed}\": {err}"))
}

fn validate_dimensions(width: u32, height: u32, app: &AppContext) -> Result<()> {
    if width == 0 && height == 0 {
        return Err(anyhow!("at least one dimension must be positive"));
    }
    let limits = &app.settings.resize;
    if width > limits.max_width {
        return Err(anyhow!("width {width} exceeds limit {}", limits.max_width));
    }
    if height > limits.max_height {
        return Err(anyhow!(
            "height {height} exceeds limit {}",
            limits.max_height
        ));
    }
    Ok(())
}

/// Candidate 0 is the path as given; when the path bears a double extension
/// whose base is itself a known format (`a.jpg.webp`), the base becomes a
/// second candidate and the cache key keeps the trailing suffix so distinct
/// output formats of one base coexist.
fn build_source_candidates(relative: &str, raw_ext: &str) -> Vec<SourceCandidate> {
    let mut candidates = vec![SourceCandidate {
        relative: relative.to_string(),
        cache_suffix: String::new(),
    }];
    if raw_ext.is_empty() {
        return candidates;
    }
    let suffix = format!(".{raw_ext}");
    let Some(base) = relative.strip_suffix(&suffix) else {
        return candidates;
    };
    let base_has_known_format = extension_of(base)
        .and_then(|ext| Format::from_extension(&ext))
        .is_some();
    if base_has_known_format {
        candidates.push(SourceCandidate {
            relative: base.to_string(),
            cache_suffix: suffix.to_ascii_lowercase(),
        });
    }
    candidates
}

fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_string)
}

fn has_jpeg_extension(path: &str) -> bool {
    matches!(
        extension_of(path).map(|ext| ext.to_ascii_lowercase()).as_deref(),
        Some("jpg") | Some("jpeg")
    )
}

async fn read_cached(app: &AppContext, cache_path: &Path) -> Result<(Vec<u8>, SystemTime)> {
    let cache = app.cache.clone();
    let path = cache_path.to_path_buf();
    task::spawn_blocking(move || cache.read_cached(&path))
        .await
        .context("cache read task")?
        .map_err(Into::into)
}

fn request_error(
    status: StatusCode,
    err: impl std::fmt::Display,
    geometry: &str,
    path: &str,
) -> RequestOutcome {
    tracing::error!(
        error = %err,
        status = status.as_u16(),
        geometry,
        path,
        "request error"
    );
    RequestOutcome::error(status)
}
