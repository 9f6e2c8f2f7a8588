// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulletin - LRP and Task State Management
//!
//! This crate is the state core of a container orchestrator. It keeps the
//! desired and actual state of long-running processes (LRPs) and one-off
//! tasks in a key-value store, arbitrates every transition with
//! compare-and-swap, and periodically converges actual state toward desired
//! state.
//!
//! # Architecture
//!
//! ```text
//!   cells / auctioneer / receptors / API callers
//!                    │
//!                    ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      bulletin (This Crate)                     │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐            │
//! │  │ DesiredLrp   │ │ LrpLifecycle │ │ TaskLifecycle│  Watchers  │
//! │  │ Store        │ │ + Evacuator  │ │ + callbacks  │            │
//! │  └──────┬───────┘ └──────┬───────┘ └──────┬───────┘            │
//! │         │   ┌────────────┴─────────┐      │                    │
//! │         │   │ LRP / Task           │◄─────┼──── timer          │
//! │         │   │ Convergence          │      │                    │
//! │         │   └────────────┬─────────┘      │                    │
//! │         ▼                ▼                ▼                    │
//! │  ┌──────────────────────────────────────────────────────┐      │
//! │  │ StoreGateway (CAS, TTL, watch)                       │      │
//! │  └──────────────────────────┬───────────────────────────┘      │
//! └─────────────────────────────┼──────────────────────────────────┘
//!                               ▼
//!                 MemoryBackend │ PostgresBackend
//! ```
//!
//! Outbound effects (auction requests, stop and cancel requests to cells,
//! completion callbacks) go through the traits in [`clients`] and are best
//! effort: the stored state is authoritative and convergence retries.
//!
//! # Actual LRP State Machine
//!
//! ```text
//!              claim             start
//!  UNCLAIMED ───────► CLAIMED ─────────► RUNNING
//!      ▲  │              │                  │
//!      │  │ fail         │ crash            │ crash
//!      │  ▼              ▼                  ▼
//!      │ (placement   restart now?  ──no──► CRASHED
//!      │  error)         │ yes                 │
//!      └─────────────────┘                     │ convergence, after backoff
//!      ▲───────────────────────────────────────┘
//! ```
//!
//! # Configuration
//!
//! The binary reads environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `BULLETIN_DATABASE_URL` | No | - | PostgreSQL connection string; memory store when unset |
//! | `BULLETIN_CONVERGE_INTERVAL_SECS` | No | `30` | Convergence period |
//! | `BULLETIN_KICK_TASK_SECS` | No | `30` | Idle time before a task is kicked |
//! | `BULLETIN_EXPIRE_PENDING_TASK_SECS` | No | `1800` | Pending task lifetime |
//! | `BULLETIN_EXPIRE_COMPLETED_TASK_SECS` | No | `120` | Completed task lifetime |
//! | `BULLETIN_RPC_TIMEOUT_MS` | No | `1000` | Outbound HTTP timeout |
//! | `BULLETIN_LOCK_TTL_SECS` | No | `10` | Bulletin lock TTL |
//! | `BULLETIN_ID` | No | random | Lock holder identifier |
//! | `BULLETIN_ADVERTISE_URL` | No | `http://127.0.0.1:8889` | URL written into the lock |
//!
//! # Modules
//!
//! - [`bbs`]: All components wired together
//! - [`store`]: Key-value store gateway and backends
//! - [`lrp`]: Desired and actual LRPs, evacuation, convergence
//! - [`task`]: Task lifecycle, callbacks, convergence
//! - [`services`]: Presence lookups and heartbeats
//! - [`watcher`]: Typed change streams
//! - [`runtime`]: Embeddable runtime with background workers

#![deny(missing_docs)]

/// The assembled bulletin board.
pub mod bbs;

/// Outbound clients for auctioneer, cells and receptors.
pub mod clients;

/// Injected time source.
pub mod clock;

/// Configuration loaded from environment variables.
pub mod config;

/// Timer-driven convergence worker.
pub mod converger;

/// Domain freshness.
pub mod domains;

/// Error types for bulletin operations.
pub mod error;

/// Long-running processes.
pub mod lrp;

/// Metric names and sinks.
pub mod metrics;

/// Database migrations for the PostgreSQL store backend.
pub mod migrations;

/// Stored entities.
pub mod models;

/// Store key schema.
pub mod paths;

/// Embeddable runtime for the bulletin board.
pub mod runtime;

/// Presence lookups and heartbeats.
pub mod services;

/// Key-value store.
pub mod store;

/// One-off tasks.
pub mod task;

/// Typed change streams over the store.
pub mod watcher;

/// Bounded concurrency for fan-out work.
pub mod work_pool;

pub use bbs::{Bbs, BbsDependencies};
pub use config::Config;
pub use error::{BbsError, Result};
