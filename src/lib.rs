//! Datagate - Tiered Data Access Gateway
//!
//! This crate implements an HTTP gateway that serves JSON datasets behind
//! per-tier rate limits. Every request is authenticated, checked against the
//! caller's tier and sliding window quota, and its dataset path is validated
//! before anything touches storage. Only successful responses are charged.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
pub mod security;
