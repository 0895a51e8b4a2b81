// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Drive Host - encrypted drive storage with peer transit delivery
//!
//! One host serves one identity (the tenant). Files live on encrypted
//! drives, are indexed for queries, and can be sent to the hosts of other
//! identities through a persistent outbox.
//!
//! ## Modules
//!
//! - `drive` - drives, file headers, payloads and the storage service
//! - `query` - the per-drive query index and its background updater
//! - `transit` - outbox, inbox, sender, receiver and peer transport
//! - `identity` - callers, ACLs, drive grants and the circle network
//! - `crypto` / `keys` - key headers, tenant master key and offline keys
//! - `storage` - on-disk layout and the embedded databases
//! - `api` - the HTTP peer perimeter (Axum)

pub mod api;
pub mod config;
pub mod crypto;
pub mod drive;
pub mod error;
pub mod identity;
pub mod keys;
pub mod query;
pub mod state;
pub mod storage;
pub mod transit;
