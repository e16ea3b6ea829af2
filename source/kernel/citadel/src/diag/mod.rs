// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics: structured logging.

#[macro_use]
pub mod log;
