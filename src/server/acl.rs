// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-adapter allow/deny IP ACL (§3 `BindAdapter.allow_list/deny_list/order`).

use std::net::IpAddr;

use crate::cfg::{enums::AclOrder, server_config::BindAdapter};

/// `true` if `ip` matches any pattern in `list`. Patterns are either exact
/// addresses or a dotted prefix (`"10.0."`), matching the teacher
/// convention of comparing stringified addresses rather than parsing CIDR
/// notation the config format never names.
fn matches_any(ip: &IpAddr, list: &[String]) -> bool {
    let ip_str = ip.to_string();
    list.iter().any(|pattern| ip_str == *pattern || ip_str.starts_with(pattern.as_str()))
}

/// Evaluates an adapter's allow/deny lists against a peer address in the
/// configured order (§3, §4.7.1): `AllowDeny` lets unmatched addresses
/// through as long as they're not denied (i.e. allow list, if non-empty,
/// must match and deny must not); `DenyAllow` lets through everything not
/// explicitly denied and not explicitly excluded from the allow list.
pub fn is_allowed(adapter: &BindAdapter, ip: &IpAddr) -> bool {
    let allow_hit = matches_any(ip, &adapter.allow_list);
    let deny_hit = matches_any(ip, &adapter.deny_list);
    match adapter.order {
        AclOrder::AllowDeny => {
            if adapter.allow_list.is_empty() {
                !deny_hit
            } else {
                allow_hit && !deny_hit
            }
        },
        AclOrder::DenyAllow => {
            if deny_hit { allow_hit } else { true }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cfg::server_config::Endpoint;

    fn adapter(allow: &[&str], deny: &[&str], order: AclOrder) -> BindAdapter {
        BindAdapter {
            name: "a".to_string(),
            servant: "App.S.Obj".to_string(),
            endpoint: Endpoint {
                transport: crate::cfg::enums::Transport::Tcp,
                host: "127.0.0.1".to_string(),
                port: 1,
                timeout: Duration::from_millis(1),
            },
            max_conns: 1,
            queue_capacity: 1,
            queue_timeout: Duration::from_millis(1),
            protocol_name: "tars".to_string(),
            handle_group_name: "a".to_string(),
            handle_count: 1,
            allow_list: allow.iter().map(|s| s.to_string()).collect(),
            deny_list: deny.iter().map(|s| s.to_string()).collect(),
            order,
            back_packet_buffer_limit: 0,
            ak: None,
            sk: None,
        }
    }

    #[test]
    fn allow_deny_with_empty_allow_list_lets_non_denied_through() {
        let a = adapter(&[], &["10.0.0.1"], AclOrder::AllowDeny);
        assert!(is_allowed(&a, &"127.0.0.1".parse().unwrap()));
        assert!(!is_allowed(&a, &"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn allow_deny_requires_allow_match_when_list_nonempty() {
        let a = adapter(&["192.168."], &[], AclOrder::AllowDeny);
        assert!(is_allowed(&a, &"192.168.1.5".parse().unwrap()));
        assert!(!is_allowed(&a, &"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn deny_allow_lets_everything_through_unless_denied() {
        let a = adapter(&[], &["10.0.0.1"], AclOrder::DenyAllow);
        assert!(is_allowed(&a, &"1.2.3.4".parse().unwrap()));
        assert!(!is_allowed(&a, &"10.0.0.1".parse().unwrap()));
    }
}
