//! Turns JSON documents into labeled gauge samples.
//!
//! Metric definitions describe where numbers live inside a JSON payload, using path expressions, and how they should be
//! labeled. At startup, every definition is bound to every configured endpoint and compiled into a
//! [`PreparedScraper`](extract::PreparedScraper). A [`Collector`](collector::Collector) then drives scrape rounds:
//! fetching each endpoint once, running every scraper bound to it, and recording the resulting samples in a
//! [`MetricRegistry`](registry::MetricRegistry).
#![deny(missing_docs)]

pub mod collector;
pub mod definition;
pub mod extract;
pub mod fetch;
pub mod path;
pub mod registry;
