//! Generation job back-end.
//!
//! ## Overview
//!
//! One external worker process runs at a time. Any connected browser can
//! start or stop it, and every browser sees the same live stream of
//! progress counts, artifact sizes and state changes over a WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Browser  │ ───────> │  server.rs  (Router, build_state, start_server)  │
//! │          │ <─────── │    ├─ api.rs  (downloads, /api/job, AppState)    │
//! └──────────┘ WebSocket│    └─ ws.rs   (EventBus, WsMessage, sessions)    │
//!                       │         │                                        │
//!                       │         │ JobController::start() / stop()        │
//!                       │         v                                        │
//!                       │  controller.rs  (job slot, per-run event pump)   │
//!                       │         │                      │                 │
//!                       │         │ Worker::spawn()      │ poller.spawn()  │
//!                       │         v                      v                 │
//!                       │  worker.rs (ProcessWorker)  poller.rs            │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                       |
//! |------------|------------------------------------------------------|
//! | `models`   | `JobConfig`, `JobState`, `ArtifactKind`, snapshots   |
//! | `progress` | Classifying worker stdout lines                      |
//!
//! ## Request Flow
//!
//! 1. A `startGeneration` frame arrives on a session in `ws.rs`.
//! 2. The controller validates it, spawns the worker and announces
//!    `running` to every observer.
//! 3. The run's pump turns stdout lines into `progress`, stderr lines into
//!    `error` for the originating observer, and poller samples into
//!    `fileSizes`.
//! 4. On worker exit the slot is cleared and `stopped` then
//!    `downloadReady` are broadcast.

pub mod api;
pub mod controller;
pub mod models;
pub mod poller;
pub mod progress;
pub mod server;
pub mod worker;
pub mod ws;
