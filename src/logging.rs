use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One served request, logged after the response has been written.
#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: IpAddr,
    pub width: u32,
    pub height: u32,
    pub path: String,
    pub cached: bool,
    pub elapsed: Duration,
    pub origin_mtime: Option<OffsetDateTime>,
}

impl AccessLogEvent {
    pub fn log(self, status: StatusCode) {
        let AccessLogEvent {
            client_ip,
            width,
            height,
            path,
            cached,
            elapsed,
            origin_mtime,
        } = self;

        let origin_mtime = origin_mtime.map(format_utc).unwrap_or_default();
        tracing::info!(
            target = "access_log",
            client_ip = %client_ip,
            width,
            height,
            path,
            cached,
            duration_ms = elapsed.as_millis() as u64,
            origin_mtime,
            status = status.as_u16(),
            "served image"
        );

        crate::metrics::record_request(status, cached, elapsed);
    }
}

/// Formats a timestamp as `YYYY-MM-DDTHH:MM:SS.mmmZ` in UTC.
pub fn format_utc(ts: OffsetDateTime) -> String {
    let ts = ts.to_offset(time::UtcOffset::UTC);
    let (year, month, day) = ts.to_calendar_date();
    let (hour, minute, second) = ts.to_hms();
    let millisecond = ts.millisecond();
    let month_number: u8 = month.into();
    format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_utc_timestamp() {
        let ts = datetime!(2024-03-09 08:05:02.120 UTC);
        assert_eq!(format_utc(ts), "2024-03-09T08:05:02.120Z");
    }
}
