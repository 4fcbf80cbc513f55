//! Structured logging for the compilation cache
//!
//! All components log through `tracing` with a shared set of field names so
//! that cache behaviour can be followed across a build cycle:
//!
//! - `service`: the component (`result_cache`, `config_store`, ...)
//! - `operation`: what it was doing (`get`, `put`, `evict`, `compile`, ...)
//! - `status`: the result (`hit`, `miss`, `success`, `error`, `suppressed`)
//! - `object_id`: cache key (hex, shortened)
//! - `size_bytes`, `platform`, `path`
//!
//! ```rust
//! use tracing::debug;
//! use tscache::logging::{operations, services, status};
//!
//! debug!(
//!     service = services::RESULT_CACHE,
//!     operation = operations::GET,
//!     status = status::HIT,
//!     object_id = "3f2a9c01d4e5b6a7",
//!     "cache hit"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Formatter that tags every line with `(tscache)` instead of the module path
struct TscacheFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for TscacheFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(tscache)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(tscache): ", meta.level())?;
        }

        // Enclosing spans, outermost first
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}: ", span.name())?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, coloured
    Pretty,
    /// Same layout without colours (CI)
    Compact,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Parse a format name, falling back to the environment default
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ => {
                if std::env::var("CI").is_ok() {
                    Self::Compact
                } else {
                    Self::Pretty
                }
            }
        }
    }

    /// Read `TSCACHE_LOG_FORMAT`
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("TSCACHE_LOG_FORMAT").unwrap_or_default())
    }
}

/// Install the global subscriber.
///
/// - `RUST_LOG` sets the filter (default `info`)
/// - `TSCACHE_LOG_FORMAT` picks `pretty`, `compact` or `json`
/// - `CI` switches the default to `compact`
///
/// Fails if a global subscriber is already installed.
pub fn try_init(format: LogFormat) -> anyhow::Result<()> {
    try_init_with_level(format, "info")
}

/// Like [`try_init`], with `default_level` used when `RUST_LOG` is unset
pub fn try_init_with_level(format: LogFormat, default_level: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    match format {
        LogFormat::Pretty | LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(TscacheFormatter {
                        with_ansi: format == LogFormat::Pretty,
                    })
                    .with_writer(io::stderr),
            )
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init()?,
    }

    Ok(())
}

/// Install the global subscriber using the format from the environment,
/// ignoring an already-installed subscriber
pub fn init() {
    let _ = try_init(LogFormat::from_env());
}

/// Standard field names
pub mod fields {
    pub const SERVICE: &str = "service";
    pub const OPERATION: &str = "operation";
    pub const STATUS: &str = "status";
    pub const OBJECT_ID: &str = "object_id";
    pub const SIZE_BYTES: &str = "size_bytes";
    pub const PLATFORM: &str = "platform";
    pub const PATH: &str = "path";
}

/// Component names
pub mod services {
    pub const RESULT_CACHE: &str = "result_cache";
    pub const DURABLE_STORE: &str = "durable_store";
    pub const CONFIG_STORE: &str = "config_store";
    pub const PARTITIONER: &str = "partitioner";
    pub const DEPENDENCIES: &str = "dependencies";
    pub const COMPILER: &str = "compiler";
    pub const TYPINGS: &str = "typings";
}

/// Operation names
pub mod operations {
    pub const GET: &str = "get";
    pub const PUT: &str = "put";
    pub const EVICT: &str = "evict";
    pub const REFRESH: &str = "refresh";
    pub const PARTITION: &str = "partition";
    pub const VALIDATE: &str = "validate";
    pub const COMPILE: &str = "compile";
    pub const MATERIALIZE: &str = "materialize";
}

/// Status values
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const ERROR: &str = "error";
    pub const STALE: &str = "stale";
    pub const SUPPRESSED: &str = "suppressed";
}
