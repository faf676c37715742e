//! Lead board, inbox and sync core for the WhatsApp business dashboard.
//!
//! ## Overview
//!
//! Leads live in user-defined columns and are ordered by a floating-point
//! position so a drag-and-drop only rewrites the moved lead. Every read goes
//! through a keyed query cache, and every write names the cache entries it
//! makes stale. Row changes are broadcast so other sessions invalidate the
//! same entries. Connection management and outbound messages are relayed to
//! automation webhooks.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    ├─ api.rs       (route handlers, AppState)    │
//! └──────────┘ WebSocket│    └─ realtime.rs  (row-change feed per user)    │
//!                       │         │                                        │
//!                       │         │ DataStore trait                        │
//!                       │         v                                        │
//!                       │  store.rs  (LocalStore + broadcast::Sender)      │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  db.rs     (BoardDb, DbHandle, SQLite)           │
//!                       └──────────────────────────────────────────────────┘
//!
//!   service.rs (LeadBoard) ── reads ──> cache.rs (QueryCache)
//!        │                  ── writes ─> DataStore, webhooks.rs
//!        └─ sync.rs (Mutation rules, MutationTracker, realtime bridge,
//!                    stats poller)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                            |
//! |-------------|-----------------------------------------------------------|
//! | `models`    | Shared types: `Lead`, `LeadColumn`, `RowChange`, ...      |
//! | `position`  | Fractional positions, drop planning, renormalization      |
//! | `uploads`   | Attachment size/MIME checks and object paths             |
//!
//! ## Typical Flow (drag a lead to another column)
//!
//! 1. `LeadBoard::move_lead(user, lead, column, index)` reads the cached
//!    leads and plans a position between the new neighbours.
//! 2. If the neighbours are too close, the column is renormalized first.
//! 3. `DataStore::move_lead` persists the single row and publishes a
//!    `RowChange`.
//! 4. On success the `Leads` entries are invalidated. On failure they are
//!    invalidated as well, so the card snaps back to its stored column.

pub mod api;
pub mod cache;
pub mod db;
pub mod models;
pub mod position;
pub mod realtime;
pub mod server;
pub mod service;
pub mod store;
pub mod sync;
pub mod uploads;
pub mod webhooks;
