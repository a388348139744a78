use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use http::StatusCode;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, Weekday};
use tokio::io::AsyncWrite;

use crate::io_util::write_all_with_timeout;

pub(super) const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// The cache path embeds the geometry, so for one URL the representation is
/// effectively immutable until an invalidation changes the underlying file.
const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable, s-maxage=31536000";

const SERVICE_IDENTIFIER: &str = "FARS";

/// Strong validator over the served bytes.
pub(crate) fn build_etag(payload: &[u8]) -> String {
    format!("\"{}\"", blake3::hash(payload).to_hex())
}

/// True iff any comma-separated candidate equals the current ETag.
pub(crate) fn etag_matches(header: &str, etag: &str) -> bool {
    header.split(',').any(|candidate| candidate.trim() == etag)
}

/// Formats an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`) in UTC.
pub(crate) fn http_date(timestamp: SystemTime) -> String {
    let dt = OffsetDateTime::from(timestamp).to_offset(time::UtcOffset::UTC);
    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        weekday_short(dt.weekday()),
        dt.day(),
        month_short(dt.month()),
        dt.year(),
        dt.hour(),
        dt.minute(),
        dt.second()
    )
}

/// Parses an IMF-fixdate. Unparseable values yield `None`; the caller falls
/// through to a full response.
pub(crate) fn parse_http_date(raw: &str) -> Option<SystemTime> {
    let parts: Vec<&str> = raw.split_ascii_whitespace().collect();
    if parts.len() != 6 || parts[5] != "GMT" {
        return None;
    }
    let day: u8 = parts[1].parse().ok()?;
    let month = month_from_short(parts[2])?;
    let year: i32 = parts[3].parse().ok()?;
    let mut clock = parts[4].split(':');
    let hour: u8 = clock.next()?.parse().ok()?;
    let minute: u8 = clock.next()?.parse().ok()?;
    let second: u8 = clock.next()?.parse().ok()?;
    if clock.next().is_some() {
        return None;
    }
    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc().into())
}

/// Drops sub-second precision so mtimes compare at the granularity HTTP
/// dates carry.
pub(crate) fn truncate_to_seconds(timestamp: SystemTime) -> SystemTime {
    match timestamp.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => UNIX_EPOCH + Duration::from_secs(since_epoch.as_secs()),
        Err(_) => timestamp,
    }
}

fn weekday_short(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Monday => "Mon",
        Weekday::Tuesday => "Tue",
        Weekday::Wednesday => "Wed",
        Weekday::Thursday => "Thu",
        Weekday::Friday => "Fri",
        Weekday::Saturday => "Sat",
        Weekday::Sunday => "Sun",
    }
}

fn month_short(month: Month) -> &'static str {
    match month {
        Month::January => "Jan",
        Month::February => "Feb",
        Month::March => "Mar",
        Month::April => "Apr",
        Month::May => "May",
        Month::June => "Jun",
        Month::July => "Jul",
        Month::August => "Aug",
        Month::September => "Sep",
        Month::October => "Oct",
        Month::November => "Nov",
        Month::December => "Dec",
    }
}

fn month_from_short(raw: &str) -> Option<Month> {
    let month = match raw {
        "Jan" => Month::January,
        "Feb" => Month::February,
        "Mar" => Month::March,
        "Apr" => Month::April,
        "May" => Month::May,
        "Jun" => Month::June,
        "Jul" => Month::July,
        "Aug" => Month::August,
        "Sep" => Month::September,
        "Oct" => Month::October,
        "Nov" => Month::November,
        "Dec" => Month::December,
        _ => return None,
    };
    Some(month)
}

fn connection_token(keep_alive: bool) -> &'static str {
    if keep_alive { "keep-alive" } else { "close" }
}

pub(super) async fn send_image<S>(
    stream: &mut S,
    payload: &[u8],
    content_type: &str,
    etag: &str,
    last_modified: &str,
    keep_alive: bool,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nCache-Control: {CACHE_CONTROL_IMMUTABLE}\r\nETag: {etag}\r\nLast-Modified: {last_modified}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        payload.len(),
        connection_token(keep_alive),
    );
    write_all_with_timeout(
        stream,
        head.as_bytes(),
        WRITE_TIMEOUT,
        "writing response header",
    )
    .await?;
    write_all_with_timeout(stream, payload, WRITE_TIMEOUT, "writing response body").await
}

pub(super) async fn send_not_modified<S>(
    stream: &mut S,
    etag: &str,
    last_modified: &str,
    keep_alive: bool,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 304 Not Modified\r\nCache-Control: {CACHE_CONTROL_IMMUTABLE}\r\nETag: {etag}\r\nLast-Modified: {last_modified}\r\nConnection: {}\r\n\r\n",
        connection_token(keep_alive),
    );
    write_all_with_timeout(
        stream,
        head.as_bytes(),
        WRITE_TIMEOUT,
        "writing response header",
    )
    .await
}

pub(super) async fn send_error<S>(stream: &mut S, status: StatusCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = error_body(status.as_u16(), reason);
    let head = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Type: text/html; charset=utf-8\r\nCache-Control: no-cache\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        body.len(),
    );
    write_all_with_timeout(
        stream,
        head.as_bytes(),
        WRITE_TIMEOUT,
        "writing error response header",
    )
    .await?;
    write_all_with_timeout(
        stream,
        body.as_bytes(),
        WRITE_TIMEOUT,
        "writing error response body",
    )
    .await
}

/// The trailing space byte is part of the body contract.
fn error_body(code: u16, reason: &str) -> String {
    format!(
        "<html><head><title>{code} {reason}</title></head><body><center><h1>{code} {reason}</h1></center><hr><center>{SERVICE_IDENTIFIER}</center></body></html> "
    )
}
