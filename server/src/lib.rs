//! ProjectPB realtime gateway.
//!
//! This crate provides the realtime server of ProjectPB, responsible for:
//! - Issuing and validating signed access tokens
//! - Authorizing subscribe/publish actions by role and topic ownership
//! - Tracking connected WebSocket clients and their subscriptions
//! - Fanning events out across server instances through a shared channel
//!
//! # Architecture
//!
//! Each instance keeps only its own connections. Published events go to the
//! shared channel (Redis, or an in-process hub for single-node and test
//! setups) and every instance delivers what it receives to its local
//! subscribers. Nothing is persisted; offline clients miss events.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod identity;
pub mod registry;
pub mod routes;
pub mod transport;
pub mod types;
