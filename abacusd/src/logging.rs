// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;
use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, Layer, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const FILTER_ENV: &str = "ABACUS_LOG";
const FORMAT_ENV: &str = "ABACUS_LOG_FORMAT";
const SPAN_EVENTS_ENV: &str = "ABACUS_LOG_SPAN_EVENTS";
const FILE_ENV: &str = "ABACUS_LOG_FILE";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Installs the global subscriber. Records emitted through the `log` facade
/// (russh and friends) are forwarded into the same pipeline.
pub fn init(verbose: bool) {
    let span_events = span_events_from(env_value(SPAN_EVENTS_ENV).as_deref());
    let format = format_from(env_value(FORMAT_ENV).as_deref());

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(format, span_events.clone(), None)];
    if let Some((writer, guard)) = build_file_writer() {
        layers.push(fmt_layer(format, span_events, Some(writer)));
        let _ = FILE_GUARD.set(guard);
    }

    Registry::default()
        .with(layers)
        .with(tracing_error::ErrorLayer::default())
        .with(build_filter(verbose))
        .init();
}

fn fmt_layer(format: LogFormat, span_events: FmtSpan, writer: Option<NonBlocking>) -> BoxedLayer {
    let base = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(span_events);
    match (format, writer) {
        (LogFormat::Json, None) => base.json().boxed(),
        (LogFormat::Json, Some(writer)) => base.json().with_ansi(false).with_writer(writer).boxed(),
        (LogFormat::Pretty, None) => base.pretty().boxed(),
        (LogFormat::Pretty, Some(writer)) => {
            base.pretty().with_ansi(false).with_writer(writer).boxed()
        }
        (LogFormat::Compact, None) => base.compact().boxed(),
        (LogFormat::Compact, Some(writer)) => {
            base.compact().with_ansi(false).with_writer(writer).boxed()
        }
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    match env::var(FILTER_ENV) {
        Ok(value) => EnvFilter::new(value),
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new("info"),
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}

fn format_from(value: Option<&str>) -> LogFormat {
    match value {
        Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::Compact,
    }
}

fn span_events_from(value: Option<&str>) -> FmtSpan {
    match value {
        Some("new") => FmtSpan::NEW,
        Some("enter") => FmtSpan::ENTER,
        Some("exit") => FmtSpan::EXIT,
        Some("close") => FmtSpan::CLOSE,
        Some("active") => FmtSpan::ACTIVE,
        Some("full") => FmtSpan::FULL,
        _ => FmtSpan::NONE,
    }
}

fn build_file_writer() -> Option<(NonBlocking, WorkerGuard)> {
    let file_path = env::var(FILE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let path = Path::new(&file_path);
    let file_name = path.file_name()?.to_string_lossy().to_string();
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}
