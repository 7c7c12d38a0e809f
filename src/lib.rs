//! Feed Ingest - A syndication feed aggregation service
//!
//! This crate polls a configured list of RSS, Atom and JSON feeds, normalizes
//! their entries and keeps the latest good snapshot per feed, serving stale
//! data when a feed is unreachable rather than failing.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod parser;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod service;
