// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields,
        format::Writer,
        writer::BoxMakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
};

use crate::cfg::config::Config;

/// Renders `[Mon dd HH:MM:SS][component] level message`, the line shape the
/// daemon has always logged and log scrapers expect.
struct DaemonFormat;

impl<S, N> FormatEvent<S, N> for DaemonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let component = meta.target().rsplit("::").next().unwrap_or("meterd");
        write!(
            writer,
            "[{}][{}] {:>5}: ",
            Local::now().format("%b %d %H:%M:%S"),
            component,
            meta.level()
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Maps the config `verbosity` knob onto a tracing directive.
fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0..=4 => "warn",
        5..=9 => "info",
        10..=14 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber. Logs go to the configured append-mode
/// file, or to stderr when no `log` path is set. The returned guard must be
/// kept alive for the non-blocking writer to flush.
pub fn init_logger(cfg: &Config) -> Result<WorkerGuard> {
    let (writer, guard) = match &cfg.log {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path.file_name().context("log path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, file);
            let (w, g) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(w), g)
        },
        None => {
            let (w, g) = tracing_appender::non_blocking(std::io::stderr());
            (BoxMakeWriter::new(w), g)
        },
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_for_verbosity(cfg.verbosity)))
        .context("failed to build log filter")?;

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .event_format(DaemonFormat);

    let subscriber = Registry::default().with(env_filter).with(layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(guard)
}
