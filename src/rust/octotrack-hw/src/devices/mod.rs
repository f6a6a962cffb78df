// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Register-level drivers for the four chips of a measurement board.
//!
//! The drivers hold no bus reference; every transfer borrows the shared
//! [`crate::Bus`] for its duration.

pub mod ads1115;
pub mod mcp23017;
pub mod mcp4728;
