//! Token lifecycle ingestion and promotion pipeline.
//!
//! Discovers candidate tokens from a free market-data feed, enriches a bounded
//! subset through a metered API, and promotes qualifying tokens into the full
//! analysis workflow. See [`pipeline`] for the components.

pub mod pipeline;
