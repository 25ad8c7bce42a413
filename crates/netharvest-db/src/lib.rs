//! netharvest document store layer
//!
//! This crate provides the storage side of the pipeline: a narrow
//! [`DocumentStore`] trait with a PostgreSQL/JSONB backend and an in-memory
//! backend sharing the same write semantics.
//!
//! # Example
//!
//! ```rust,no_run
//! use netharvest_db::{DocumentStore, PgDocumentStore};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PgDocumentStore::connect(
//!         "postgres://localhost:5432/netharvest",
//!         "etl_data",
//!         5,
//!         Duration::from_secs(5),
//!     )
//!     .await?;
//!     store.ping().await?;
//!     store.ensure_collection("cloudflare_trace_raw").await?;
//!     store.close().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{DbError, Result};
pub use memory::MemoryStore;
pub use postgres::{redact_url, PgDocumentStore};
pub use store::{DocumentStore, FieldFilter, WriteFailure, WriteSummary};
