//! # HVDC Log Store
//!
//! A local-first ingestion and KPI reporting service for HVDC logistics
//! WhatsApp summary logs.
//!
//! The store accepts authenticated log submissions over HTTP, fans each
//! record out to three sinks (audit CSV, SQLite, bronze JSONL), and rolls
//! the bronze layer up into a DuckDB warehouse that backs daily KPI
//! queries and CSV exports.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌─────────────┐
//! │  HTTP    │──▶│  Triple sink              │──▶│  DuckDB      │
//! │  ingest  │   │  CSV / SQLite / bronze    │   │  raw→silver  │
//! └──────────┘   └───────────────────────────┘   └──────┬──────┘
//!                                                       │
//!                                   ┌───────────────────┤
//!                                   ▼                   ▼
//!                              ┌──────────┐       ┌───────────┐
//!                              │   CLI    │       │  /kpi +   │
//!                              │  (hvdc)  │       │  export   │
//!                              └──────────┘       └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hvdc init                     # create database
//! hvdc serve                    # start HTTP server
//! hvdc pipeline run             # bronze → silver → KPI view
//! hvdc kpi --since 2024-01-01   # daily KPI rows
//! hvdc stats                    # store overview
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and validation |
//! | [`auth`] | API-key and HMAC signature checks |
//! | [`mask`] | PII masking and group-name sanitizing |
//! | [`idempotency`] | Replay ledger for ingest requests |
//! | [`store`] | Triple-sink persistence |
//! | [`jobs`] | Async job tracking |
//! | [`pipeline`] | Bronze → silver → KPI rollup (DuckDB) |
//! | [`kpi`] | KPI queries and streamed CSV export |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod auth;
pub mod config;
pub mod db;
pub mod idempotency;
pub mod jobs;
pub mod kpi;
pub mod mask;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod stats;
pub mod store;
