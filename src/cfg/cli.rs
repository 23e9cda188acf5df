// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const DEFAULT_CONFIG: &str = "/etc/meterd.json";

/// The few switches the daemon takes; everything else lives in the config
/// file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config: PathBuf,
    /// Register the configured channels with their middleware and exit.
    pub register: bool,
    /// Overrides the config `foreground` flag.
    pub foreground: bool,
}

/// Parses `[config-path] [--register] [--foreground]` from the process
/// arguments.
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<CliArgs> {
    let mut parsed = CliArgs {
        config: PathBuf::from(DEFAULT_CONFIG),
        register: false,
        foreground: false,
    };

    for arg in args {
        match arg.as_str() {
            "--register" | "-r" => parsed.register = true,
            "--foreground" | "-f" => parsed.foreground = true,
            flag if flag.starts_with('-') => bail!("unknown option {flag:?}"),
            path => parsed.config = PathBuf::from(path),
        }
    }

    Ok(parsed)
}

/// Resolves a possibly relative config path against the working directory.
pub fn resolve_config_path<P: AsRef<Path>>(rel: P) -> Result<PathBuf> {
    let p = rel.as_ref();

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}
