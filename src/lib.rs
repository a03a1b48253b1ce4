//! A Rust client for NASA Earthdata: search the CMR metadata catalog and fetch the
//! files behind the results.
//!
//! The crate has two engines:
//! - a paginated query engine ([`Catalog`]) that turns a validated [`Query`] into a
//!   lazy sequence of [`Record`]s using the catalog's search-after protocol;
//! - a concurrent transfer engine ([`TransferEngine`]) that downloads or opens the
//!   data links of many records on a bounded worker pool, with retries and
//!   short-lived credentials refreshed on demand.
//!
//! ## Quick start
//! - Configure authentication via `EARTHDATA_TOKEN`, `EARTHDATA_USERNAME` /
//!   `EARTHDATA_PASSWORD`, or a `.netrc` entry for `urs.earthdata.nasa.gov`.
//! - Build a query, page through it, and hand the records to [`Client::download`].
//!
//! ```no_run
//! use earthaccess::Client;
//!
//! fn main() -> earthaccess::Result<()> {
//!     let client = Client::from_env()?;
//!     let query = client
//!         .granules()
//!         .short_name("ATL06")
//!         .temporal("2020-01-01", "2020-01-31")
//!         .bounding_box(-46.5, 61.0, -42.5, 63.0)
//!         .build()?;
//!
//!     println!("{} granules match", client.count(&query)?);
//!     let granules = client.get(&query, Some(10))?;
//!     let report = client.download(&granules, "data")?;
//!     for failure in &report.failed {
//!         eprintln!("{}: {}", failure.record.concept_id(), failure.error);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! For full usage and configuration details, see the crate README.

#![forbid(unsafe_code)]

pub mod catalog;
mod client;
mod config;
pub mod credentials;
pub mod daac;
mod error;
pub mod query;
pub mod record;
mod sigv4;
pub mod store;
pub mod transfer;
mod util;

pub use catalog::{Catalog, CatalogTransport, HttpCatalogTransport, PageRequest, ResultPage};
pub use client::{Client, ClientConfig};
pub use config::System;
pub use credentials::{CredentialCache, CredentialProvider, EarthdataAuth};
pub use error::{Error, FailureReason, Result, TransferTaskError};
pub use query::{Query, QueryBuilder, QueryKind, Spatial, TemporalRange};
pub use record::{AccessClass, AccessLink, Record, RecordKind};
pub use store::{HttpObjectStore, ObjectStore, RemoteFile};
pub use transfer::{
    Artifact, CancelFlag, TransferEngine, TransferFailure, TransferMode, TransferOptions,
    TransferReport,
};
