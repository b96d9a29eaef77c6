//! Real-time arrivals for Sofia public transport
//!
//! Polls the [sofiatraffic.bg](https://www.sofiatraffic.bg) virtual table for
//! a configured list of stops and publishes one normalized record per line.
//!
//! # Architecture
//!
//! [`SofiaTrafficClient`] implements the [`StopFetcher`] trait. It keeps the
//! session cookies in a shared [`TokenStore`], filled by [`TokenAcquirer`], and
//! retries each stop with backoff while [`classify`] sorts every response.
//! [`RefreshCoordinator`] runs the fetch cycle and exposes the result through
//! a [`PublishedLines`] handle.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use integration_sofia_transit::{
//!     RefreshCoordinator, SofiaTrafficClient, SofiaTransitConfig, TokenStore,
//! };
//!
//! let config = SofiaTransitConfig::load(None)?;
//! let client = SofiaTrafficClient::new(&config, Arc::new(TokenStore::new()))?;
//! let mut coordinator = RefreshCoordinator::new(
//!     client,
//!     config.stop_ids()?,
//!     config.update_interval(),
//!     config.failure_threshold,
//! );
//!
//! let lines = coordinator.first_refresh().await?;
//! ```

mod acquirer;
mod backoff;
mod classify;
mod client;
mod config;
mod coordinator;
mod error;
mod models;
mod normalize;
mod tokens;

pub use acquirer::{CSRF_COOKIE_PATH, PUBLIC_PAGE_PATH, TokenAcquirer};
pub use backoff::BackoffConfig;
pub use classify::{
    Classification, HtmlDiagnostics, PageIndicators, classify, extract_csrf_meta,
};
pub use client::{SofiaTrafficClient, StopFetcher, VIRTUAL_TABLE_PATH};
pub use config::{ENV_PREFIX, SofiaTransitConfig, parse_stop_ids};
pub use coordinator::{MIN_REFRESH_INTERVAL, PublishedLines, RefreshCoordinator};
pub use error::{FailureKind, TransitError};
pub use models::{AggregateResult, LineRecord, RawProviderPayload, RawRoute, VehicleType};
pub use normalize::{normalize_route, normalize_stop};
pub use tokens::{SESSION_COOKIE, TokenState, TokenStore, XSRF_COOKIE, mask};
