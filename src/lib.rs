//! Flowstats - traffic aggregation store for proxy gateways
//!
//! Connection deltas go in through the write buffer; cumulative stats,
//! time-bucketed range reads and chain-flow graphs come out of
//! [`stats::StatsService`].

pub mod aggregate;
pub mod cache;
pub mod chain_flow;
pub mod clickhouse;
pub mod config;
pub mod db;
pub mod error;
pub mod geoip;
pub mod model;
pub mod stats;
