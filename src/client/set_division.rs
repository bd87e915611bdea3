// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Set division (GLOSSARY): the `<name>.<area>.<group>` tag used for
//! topology-aware routing and proxy memoization (§4.8.1 supplement, SPEC_FULL
//! §4.8).

use std::fmt;

/// A parsed `name.area.group` set division, or the absence of one (servants
/// not participating in set-based routing use the unqualified object name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SetDivision {
    pub name: String,
    pub area: String,
    pub group: String,
}

impl SetDivision {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '.');
        let name = parts.next()?;
        let area = parts.next()?;
        let group = parts.next()?;
        if name.is_empty() || area.is_empty() || group.is_empty() {
            return None;
        }
        Some(Self { name: name.to_string(), area: area.to_string(), group: group.to_string() })
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.area.is_empty() && self.group.is_empty()
    }
}

impl fmt::Display for SetDivision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.name, self.area, self.group)
    }
}
