//! # vectorlite
//!
//! An embedded, single-process vector search engine: a persistent,
//! SQLite-backed store that ingests embedding vectors together with textual
//! content and metadata, and answers similarity queries (top-K, range, and
//! facet-filtered) against collections too large for a comfortable flat
//! scan.
//!
//! There is no network service and no embedding-model provider here —
//! vectors arrive pre-computed from the caller. The crate covers four
//! tightly-coupled subsystems:
//!
//! 1. **Storage and indexing** — [`schema`], [`models`], [`migrations`], the
//!    [`hnsw`] and [`ivf`] ANN indexes, and the FTS5 mirror they stay in
//!    sync with.
//! 2. **Query execution** — [`executor`]: candidate generation, scoring,
//!    ranking, hybrid merging, and facet counting.
//! 3. **Dimension adaptation** — [`dimension`]: policy-driven reshaping so
//!    heterogeneous-dimension inputs coexist in one collection.
//! 4. **Import/export** — [`importexport`]: deterministic JSON/JSONL dump
//!    and load for backup and migration.
//!
//! [`store::Store`] is the single entry point tying all four together under
//! one coarse reader/writer lock; see its docs for the full lifecycle.
//!
//! ## Example
//!
//! ```no_run
//! use vectorlite::store::{Store, NewEmbedding};
//! use vectorlite::executor::SearchOptions;
//! use vectorlite::cancellation::CancellationToken;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::new("my_store.db", 3);
//! store.init(&CancellationToken::none())?;
//!
//! store.upsert(
//!     NewEmbedding::new("doc1", vec![1.0, 0.0, 0.0], "hello world"),
//!     &CancellationToken::none(),
//! )?;
//!
//! let hits = store.search(
//!     &[1.0, 0.0, 0.0],
//!     None,
//!     &SearchOptions { top_k: 5, ..Default::default() },
//!     &CancellationToken::none(),
//! )?;
//! # let _ = hits;
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cancellation;
pub mod config;
pub mod dimension;
pub mod error;
pub mod executor;
pub mod facets;
pub mod hnsw;
pub mod importexport;
pub mod ivf;
pub mod migrations;
pub mod models;
pub mod schema;
pub mod session_messages;
pub mod similarity;
pub mod store;
