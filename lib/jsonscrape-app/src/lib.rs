//! High-level application primitives.
//!
//! This crate provides the primitives needed to bootstrap the exporter before it starts serving, such as initializing
//! logging.
#![deny(missing_docs)]

pub mod logging;
