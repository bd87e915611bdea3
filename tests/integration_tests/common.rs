// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use tars_rt::{
    cfg::{
        enums::{AclOrder, Transport},
        server_config::{BindAdapter, Endpoint, ServerConfig},
    },
    server::protocol::{LengthPrefixed, ProtocolParser, frame},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

/// Spawns a raw TCP server that frames each request the same way a real
/// adapter/`ClientConnection` pair does, and replies with the 4-byte
/// request-id envelope untouched but `tag` appended to the payload, so a
/// test can tell which of several servers actually answered a call.
pub async fn spawn_tagged_echo(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("listener has a local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _peer)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let parser = LengthPrefixed::new(0);
                let mut scratch = BytesMut::with_capacity(4096);
                let mut buf = [0u8; 4096];
                loop {
                    let n = match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    scratch.extend_from_slice(&buf[..n]);
                    let Ok(frames) = parser.parse_all(&mut scratch) else { break };
                    for body in frames {
                        if body.len() < 4 {
                            continue;
                        }
                        let (id, payload) = body.split_at(4);
                        let mut tagged = BytesMut::with_capacity(4 + payload.len() + tag.len());
                        tagged.extend_from_slice(id);
                        tagged.extend_from_slice(payload);
                        tagged.extend_from_slice(tag.as_bytes());
                        if sock.write_all(&frame(&tagged)).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    addr
}

/// A minimal adapter config suitable for driving the net thread / handle
/// group stack directly in tests, with every field the harness doesn't
/// care about defaulted to "off".
pub fn sample_bind_adapter(name: &str, servant: &str, queue_capacity: usize, queue_timeout: Duration, handle_count: u32) -> BindAdapter {
    BindAdapter {
        name: name.to_string(),
        servant: servant.to_string(),
        endpoint: Endpoint {
            transport: Transport::Tcp,
            host: "127.0.0.1".to_string(),
            port: 0,
            timeout: Duration::from_secs(1),
        },
        max_conns: 128,
        queue_capacity,
        queue_timeout,
        protocol_name: "tars".to_string(),
        handle_group_name: name.to_string(),
        handle_count,
        allow_list: Vec::new(),
        deny_list: Vec::new(),
        order: AclOrder::AllowDeny,
        back_packet_buffer_limit: 0,
        ak: None,
        sk: None,
    }
}

pub fn sample_server_config(datapath: &str, adapters: Vec<BindAdapter>) -> ServerConfig {
    ServerConfig {
        app: "Demo".to_string(),
        server: "S".to_string(),
        localip: "127.0.0.1".to_string(),
        basepath: ".".to_string(),
        datapath: datapath.to_string(),
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
        adapters,
    }
}

pub fn envelope_frame(request_id: u32, payload: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + payload.len());
    body.extend_from_slice(&request_id.to_be_bytes());
    body.extend_from_slice(payload);
    frame(&body)
}
