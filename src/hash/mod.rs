// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Consistent-hash ring (§4.4): Ketama and XOR-folded MD5 variants.

pub mod consistent;
