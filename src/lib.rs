//! # Telegram Warehouse
//!
//! Incremental scraping of public Telegram channels into a local SQLite
//! warehouse, with optional image labelling and a read-only query API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │  Source  │──▶│  Fetch   │──▶│ Landing  │──▶│   Load   │
//! │ HTTP/Exp │   │ per chan │   │ JSON/day │   │  SQLite  │
//! └──────────┘   └────┬─────┘   └──────────┘   └────┬─────┘
//!                     │ checkpoints.json            │
//!                     ▼                             ▼
//!                ┌──────────┐   ┌──────────┐   ┌──────────┐
//!                │  Images  │──▶│  Enrich  │──▶│  Report  │──▶ HTTP API
//!                └──────────┘   │  CSV     │   │ dim/fct  │
//!                               └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tgw init                 # create the warehouse
//! tgw scrape               # fetch new messages for every configured channel
//! tgw load                 # load landed batches
//! tgw enrich               # label downloaded photos
//! tgw load-detections
//! tgw report               # rebuild reporting tables and run checks
//! tgw serve                # start the query API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and credentials |
//! | [`checkpoint`] | Per-channel resume points |
//! | [`source`] | Remote source trait and errors |
//! | [`fetch`] | Concurrent incremental channel fetch |
//! | [`landing`] | Day-partitioned JSON batch files |
//! | [`load`] | Transactional, idempotent warehouse load |
//! | [`detector`] | Object detectors and image classification |
//! | [`enrich`] | Detection CSV generation |
//! | [`load_detections`] | Detection CSV load |
//! | [`report`] | Dimension and fact tables |
//! | [`query`] | Analytical queries |
//! | [`server`] | HTTP query API |
//! | [`pipeline`] | Full run in stage order |

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod detector;
pub mod enrich;
pub mod fetch;
pub mod fsio;
pub mod landing;
pub mod load;
pub mod load_detections;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod report;
pub mod server;
pub mod source;
pub mod source_export;
pub mod source_http;
pub mod stats;
