// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key and subscriber persistence.
//!
//! - [`traits`]: collection traits and [`StorageError`](traits::StorageError)
//! - [`memory`]: `DashMap` collections for tests and single-process use
//! - [`sql`]: SQLite/MySQL collections via sqlx
//! - [`transactional`]: two-phase writes over the primary and reference collections

pub mod memory;
pub mod sql;
pub mod traits;
pub mod transactional;
