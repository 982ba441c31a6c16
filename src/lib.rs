//! # Asset Vault
//!
//! Resumable document ingestion into per-project Git storage.
//!
//! Clients upload files over the tus resumable protocol (or a one-shot
//! multipart request). Completed uploads are staged and handed to an
//! in-process task queue, whose workers validate each file and commit it into
//! the owning project's bare repository. Projects are provisioned the same
//! way: a queued task builds the bare repository, links the shared hook, and
//! pushes an initial manifest commit.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────────┐
//! │ HTTP (axum)  │──▶│  TaskQueue   │──▶│ CREATE_REPO       │──▶ bare repos
//! │ tus / direct │   │ worker pool  │   │ PROCESS_ASSET     │    (per project)
//! │ projects     │   └──────┬───────┘   └───────────────────┘
//! └──────────────┘          │ poll
//!                           ▼
//!                    GET /api/tasks/{id}
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vault --config ./vault.toml init
//! vault --config ./vault.toml serve
//! vault --config ./vault.toml create-project --owner user-1 --name "Thesis"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`app`] | Component wiring |
//! | [`queue`] | Task queue and handler registry |
//! | [`upload`] | Resumable upload receiver and direct staging |
//! | [`provision`] | Project creation and `CREATE_REPO` |
//! | [`ingest`] | `PROCESS_ASSET` state machine |
//! | [`access`] | Authorization and quota policy |
//! | [`locks`] | Per-repository locks |
//! | [`staging`] | Staging area and work directories |
//! | [`git`] | Git command wrappers |
//! | [`server`] | HTTP server |
//!
//! Runtime-free types (tasks, payloads, errors, sanitizers) live in the
//! `asset-vault-core` crate.

pub mod access;
pub mod app;
pub mod config;
pub mod git;
pub mod ingest;
pub mod locks;
pub mod provision;
pub mod queue;
pub mod server;
pub mod staging;
pub mod upload;

pub use app::Vault;
pub use asset_vault_core as core;
