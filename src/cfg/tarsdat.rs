// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Persisted `${datapath}/${server}.tarsdat` key-value cache (§6, §3).
//!
//! Survives restarts: the admin handlers `tars.setloglevel` and
//! `tars.closecore` (§4.7.5) rewrite it, and bootstrap reads it back before
//! the configured log level/close-cout default is applied, matching
//! scenario S6.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TarsDat {
    pub log_level: String,
    pub close_cout: bool,
    /// `tars.closecore {yes|no}` toggle (§4.7.5) — whether this process
    /// should dump core on a fatal signal. Distinct from `close_cout`,
    /// which controls stdout, not crash-dump behavior.
    #[serde(default)]
    pub core_dump: bool,
    #[serde(default)]
    pub locator_cache: Vec<String>,
}

impl Default for TarsDat {
    fn default() -> Self {
        Self { log_level: "INFO".to_string(), close_cout: true, core_dump: false, locator_cache: Vec::new() }
    }
}

impl TarsDat {
    pub fn path(datapath: &str, server: &str) -> PathBuf {
        Path::new(datapath).join(format!("{server}.tarsdat"))
    }

    /// Loads the persisted state, defaulting if the file does not yet
    /// exist.
    pub async fn load(datapath: &str, server: &str) -> Result<Self> {
        let path = Self::path(datapath, server);
        match fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Rewrites the persisted state file, creating `datapath` if necessary.
    pub async fn store(&self, datapath: &str, server: &str) -> Result<()> {
        fs::create_dir_all(datapath)
            .await
            .with_context(|| format!("failed to create datapath {datapath}"))?;
        let path = Self::path(datapath, server);
        let json = serde_json::to_string_pretty(self).context("serialize tarsdat")?;
        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(json.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
