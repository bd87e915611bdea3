// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server core (§4.7): one [`Server`] owns every bound
//! [`adapter::AdapterRuntime`], the net-thread accept loop and handle-thread
//! pool behind each, and the synthesized `admin` adapter's command registry.

pub mod acl;
pub mod adapter;
pub mod admin;
pub mod auth;
pub mod connection;
pub mod handle_group;
pub mod net_thread;
pub mod protocol;
pub mod servant;

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cfg::{logger::LogHandle, server_config::ServerConfig, tarsdat::TarsDat},
    server::{
        adapter::AdapterRuntime,
        admin::AdminContext,
        net_thread::EmptyConnPolicy,
        protocol::{LengthPrefixed, ProtocolParser},
        servant::Servant,
    },
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no servant registered for adapter {adapter:?} (expects servant {servant:?})")]
    MissingServant { adapter: String, servant: String },
}

/// Bootstraps and owns the whole server side of one process: every
/// adapter's accept loop and handle-thread pool, wired per
/// [`ServerConfig::from_domain`], plus the built-in `admin` adapter (§4.7.1,
/// §4.7.5).
pub struct Server {
    pub config: ServerConfig,
    pub adapters: Vec<Arc<AdapterRuntime>>,
    net_tasks: Vec<JoinHandle<()>>,
    handle_tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Server {
    /// Builds every configured adapter, binding `servants` by name (§3
    /// "a bind adapter names exactly one servant"); the synthesized `admin`
    /// adapter gets [`admin::admin_servant`] automatically rather than
    /// requiring the caller to supply one. Spawns nothing yet — call
    /// [`Self::serve`] once construction succeeds.
    pub fn build(
        config: ServerConfig,
        mut servants: HashMap<String, Servant>,
        tarsdat: Arc<tokio::sync::Mutex<TarsDat>>,
        log_handle: Option<Arc<LogHandle>>,
    ) -> Result<Self, ServerError> {
        let cancel = CancellationToken::new();
        let mut adapters = Vec::with_capacity(config.adapters.len());
        let mut admin_bind = None;

        for bind in &config.adapters {
            if bind.name == "admin" {
                admin_bind = Some(bind.clone());
                continue;
            }
            let servant = servants.remove(&bind.servant).ok_or_else(|| ServerError::MissingServant {
                adapter: bind.name.clone(),
                servant: bind.servant.clone(),
            })?;
            let protocol: Arc<dyn ProtocolParser> = Arc::new(LengthPrefixed::new(0));
            adapters.push(Arc::new(AdapterRuntime::new(bind.clone(), protocol, servant)));
        }

        // The admin adapter is built last so its servant can see every
        // other adapter already assembled (§4.7.5's `tars.viewstatus`/
        // `tars.connection`); it does not see itself in that list.
        if let Some(bind) = admin_bind {
            let ctx = Arc::new(AdminContext::new(
                config.clone(),
                adapters.clone(),
                Arc::clone(&tarsdat),
                log_handle.clone(),
                cancel.clone(),
            ));
            let servant = admin::admin_servant(ctx, Arc::new(admin::builtin_registry()));
            let protocol: Arc<dyn ProtocolParser> = Arc::new(LengthPrefixed::new(0));
            adapters.push(Arc::new(AdapterRuntime::new(bind, protocol, servant)));
        }

        Ok(Self { config, adapters, net_tasks: Vec::new(), handle_tasks: Vec::new(), cancel })
    }

    /// Spawns every adapter's net-thread accept loop and handle-thread pool
    /// (§4.7.2, §4.7.3). Idempotent only in the sense that calling it twice
    /// spawns a second set of tasks against the same adapters; callers are
    /// expected to call it exactly once per [`Server`].
    pub fn serve(&mut self) {
        let empty_conn = EmptyConnPolicy {
            enabled: self.config.empty_con_check,
            timeout: self.config.empty_conn_timeout,
        };
        let coroutine_policy = handle_group::CoroutinePolicy::from_config(&self.config);
        for adapter in &self.adapters {
            info!(adapter = %adapter.config.name, endpoint = %adapter.config.endpoint.socket_addr(), "binding adapter");
            self.net_tasks.push(tokio::spawn(net_thread::run(
                Arc::clone(adapter),
                empty_conn,
                self.cancel.child_token(),
            )));
            self.handle_tasks.extend(handle_group::spawn(Arc::clone(adapter), coroutine_policy));
        }
    }

    /// Graceful shutdown (§5): signal every net thread to stop accepting
    /// and close existing connections, then wait for every handle thread to
    /// drain its adapter's queue before returning.
    pub async fn terminate(self) {
        self.cancel.cancel();
        for task in self.net_tasks {
            let _ = task.await;
        }
        for task in self.handle_tasks {
            let _ = task.await;
        }
        info!("server terminated");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cfg::{
        enums::{AclOrder, Transport},
        server_config::{BindAdapter, Endpoint},
    };

    fn config_with_echo_and_admin() -> ServerConfig {
        ServerConfig {
            app: "Demo".to_string(),
            server: "S".to_string(),
            localip: "127.0.0.1".to_string(),
            basepath: ".".to_string(),
            datapath: std::env::temp_dir().join(format!("server-test-{}", std::process::id())).to_string_lossy().to_string(),
            logpath: ".".to_string(),
            logsize: 0,
            lognum: 1,
            local: None,
            log_level: "INFO".to_string(),
            netthread: 1,
            opencoroutine: false,
            coroutine_mem_size: 0,
            coroutine_stack_size: 0,
            close_cout: true,
            logstatreport: false,
            empty_con_check: false,
            empty_conn_timeout: Duration::from_secs(3),
            reportflow: true,
            checkset: true,
            pool_min_block_size: 0,
            pool_max_block_size: 0,
            pool_max_bytes: 0,
            back_packet_buffer_limit: 0,
            adapters: vec![
                BindAdapter {
                    name: "echo".to_string(),
                    servant: "Demo.S.Echo".to_string(),
                    endpoint: Endpoint { transport: Transport::Tcp, host: "127.0.0.1".to_string(), port: 0, timeout: Duration::from_secs(1) },
                    max_conns: 8,
                    queue_capacity: 8,
                    queue_timeout: Duration::from_secs(1),
                    protocol_name: "tars".to_string(),
                    handle_group_name: "echo".to_string(),
                    handle_count: 1,
                    allow_list: Vec::new(),
                    deny_list: Vec::new(),
                    order: AclOrder::AllowDeny,
                    back_packet_buffer_limit: 0,
                    ak: None,
                    sk: None,
                },
                BindAdapter {
                    name: "admin".to_string(),
                    servant: "Demo.S.AdminObj".to_string(),
                    endpoint: Endpoint { transport: Transport::Tcp, host: "127.0.0.1".to_string(), port: 0, timeout: Duration::from_secs(1) },
                    max_conns: 8,
                    queue_capacity: 8,
                    queue_timeout: Duration::from_secs(1),
                    protocol_name: "tars".to_string(),
                    handle_group_name: "admin".to_string(),
                    handle_count: 1,
                    allow_list: Vec::new(),
                    deny_list: Vec::new(),
                    order: AclOrder::AllowDeny,
                    back_packet_buffer_limit: 0,
                    ak: None,
                    sk: None,
                },
            ],
        }
    }

    #[test]
    fn build_fails_when_a_non_admin_servant_is_missing() {
        let config = config_with_echo_and_admin();
        let err = Server::build(config, HashMap::new(), Arc::new(tokio::sync::Mutex::new(TarsDat::default())), None)
            .unwrap_err();
        assert!(matches!(err, ServerError::MissingServant { .. }));
    }

    #[tokio::test]
    async fn build_succeeds_with_admin_synthesized_automatically() {
        let config = config_with_echo_and_admin();
        let mut servants = HashMap::new();
        servants.insert("Demo.S.Echo".to_string(), servant::echo_servant());
        let server = Server::build(config, servants, Arc::new(tokio::sync::Mutex::new(TarsDat::default())), None).unwrap();
        assert_eq!(server.adapters.len(), 2);
        assert!(server.adapters.iter().any(|a| a.config.name == "admin"));
    }

    #[tokio::test]
    async fn serve_then_terminate_joins_every_task() {
        let config = config_with_echo_and_admin();
        let mut servants = HashMap::new();
        servants.insert("Demo.S.Echo".to_string(), servant::echo_servant());
        let mut server = Server::build(config, servants, Arc::new(tokio::sync::Mutex::new(TarsDat::default())), None).unwrap();
        server.serve();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.terminate().await;
    }
}
