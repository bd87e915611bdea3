// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bootstrap command-line parsing (§6: `--config=<path>`, `--version`).
//! No `clap`/`argh` dependency: the surface is two flags, and the teacher
//! crate favors a hand-rolled parse for its own equally small CLIs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// The bootstrap binary's resolved intent: print the version and exit, or
/// run the server against a resolved config path.
pub enum Action {
    PrintVersion,
    Run { config_path: PathBuf },
}

/// Parses `--config=<path>` (required unless `--version` is given) and
/// `--version` out of `args` (excluding argv[0]).
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Action> {
    let mut config: Option<String> = None;
    for arg in args {
        if arg == "--version" || arg == "-v" {
            return Ok(Action::PrintVersion);
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(path.to_string());
        } else {
            bail!("unrecognized argument {arg:?}; expected --config=<path> or --version");
        }
    }
    match config {
        Some(rel) => Ok(Action::Run { config_path: resolve_config_path(&rel)? }),
        None => bail!("missing required --config=<path>"),
    }
}
