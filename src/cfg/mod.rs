//! This module handles configuration, command-line parsing, and logging.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Client-side configuration (communicator, net threads, report sinks).
pub mod client_config;
/// Command-line interface parsing.
pub mod cli;
/// Hierarchical braced-domain configuration parser and tree.
pub mod config;
/// Enumerations used in configuration.
pub mod enums;
/// Logger initialization.
pub mod logger;
/// Server-side configuration (adapters, handle groups, pools).
pub mod server_config;
/// Persisted `${datapath}/${server}.tarsdat` key-value cache.
pub mod tarsdat;
