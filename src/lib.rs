//! Raider Sync - raider & gear database sync engine
//!
//! Merges raider records scraped from game and chain data sources into one
//! SQLite store, deduplicates gear via content hashing, migrates the on-disk
//! schema across versions, and publishes compressed, versioned snapshots that
//! other processes poll and fetch incrementally.

pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod gear;
pub mod import;
pub mod migrate;
pub mod progress;
pub mod publish;
pub mod source;
pub mod web;

pub use config::Config;
pub use database::SnapshotInfo;
pub use error::{Result, SyncError};
pub use gear::GearStore;
