//! Round table: turn-based multi-agent discussion engine.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, start_server)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ RoundTableService                      │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (run / pause / resume)         │
//!                       │    ├─ registry.rs   (SpeakerRoster)              │
//!                       │    ├─ phase.rs      (PhaseGraph, transition)     │
//!                       │    ├─ scheduler.rs  (TurnScheduler, policies)    │
//!                       │    ├─ lifecycle.rs  (RunRegistry, resume cursor) │
//!                       │    └─ transcript.rs (append-only message log)    │
//!                       │         │                                        │
//!                       │         │ Generator::generate()                  │
//!                       │         v                                        │
//!                       │  generation.rs  (chat completions, echo)         │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! Persistence lives in `db.rs` (SQLite through `DbHandle`) with the row and
//! payload types in `models.rs`. Live events are pushed to `/ws` subscribers
//! by `ws.rs`. `kamiwaza.rs` lists the models a Kamiwaza server has deployed.

pub mod api;
pub mod db;
pub mod generation;
pub mod kamiwaza;
pub mod lifecycle;
pub mod models;
pub mod orchestrator;
pub mod phase;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod transcript;
pub mod ws;
