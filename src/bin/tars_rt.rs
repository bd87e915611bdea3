// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use tars_rt::{
    cfg::{
        cli::{Action, parse_args},
        client_config::ClientConfig,
        config,
        enums::RoutingMode,
        logger::init_logger,
        server_config::ServerConfig,
        tarsdat::TarsDat,
    },
    client::{communicator::Communicator, endpoint::{Locator, StaticLocator}},
    server::{Server, servant::echo_servant},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = match parse_args(std::env::args().skip(1))? {
        Action::PrintVersion => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        },
        Action::Run { config_path } => config_path,
    };

    let raw = tokio::fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("failed to read config {}", config_path.display()))?;
    let root = config::parse(&raw).context("failed to parse configuration")?;

    let mut server_config =
        ServerConfig::from_domain(&root).context("invalid /tars/application/server section")?;
    let client_config =
        ClientConfig::from_domain(&root).context("invalid /tars/application/client section")?;

    // The persisted `tars.setloglevel` value (§4.7.5, scenario S6) overrides
    // whatever `log` the config file names, if it was ever changed at
    // runtime by a previous process.
    let tarsdat = Arc::new(tokio::sync::Mutex::new(
        TarsDat::load(&server_config.datapath, &server_config.server)
            .await
            .context("failed to load persisted tarsdat")?,
    ));
    server_config.log_level = tarsdat.lock().await.log_level.clone();

    let log_handle = Arc::new(init_logger(&server_config).context("failed to initialize logging")?);
    info!(app = %server_config.app, server = %server_config.server, "starting");

    // Generated per-servant business logic is out of scope (§1); every
    // non-admin adapter gets the crate's echo default so the bound adapters
    // are runnable end-to-end without a code generator.
    let mut servants = HashMap::new();
    for adapter in &server_config.adapters {
        if adapter.name != "admin" {
            servants.insert(adapter.servant.clone(), echo_servant());
        }
    }

    let mut server = Server::build(server_config, servants, Arc::clone(&tarsdat), Some(Arc::clone(&log_handle)))
        .context("failed to assemble server adapters")?;
    server.serve();

    // The communicator side of the process (§4.8): no outbound calls are
    // driven by this bootstrap binary itself, but constructing it here
    // exercises the same locator/routing wiring a real servant would use to
    // call other servers.
    let locator: Arc<dyn Locator> = Arc::new(StaticLocator::new());
    let communicator = Communicator::new(client_config, locator, RoutingMode::ConsistentHash);

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    communicator.shutdown();
    server.terminate().await;
    Ok(())
}
