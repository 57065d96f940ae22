//! # Lifecycle / control
//!
//! [`Store`] is the single entry point: construct with [`Store::new`] or
//! [`Store::new_with_config`] (touches no disk), [`Store::init`] to open the
//! file and bring up indexes, then the CRUD and query methods, finally
//! [`Store::close`]. A single coarse [`std::sync::RwLock`] serializes writers
//! against readers; beneath it, reads fan out over an r2d2 connection pool
//! and writes serialize through one connection, mirroring the storage
//! layer's WAL read-concurrency design.

use std::path::Path;
use std::sync::RwLock;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::SqliteConnection;

use crate::cancellation::CancellationToken;
use crate::config::StoreConfig;
use crate::dimension::{adapt_vector, DimensionPolicy};
use crate::error::{from_diesel, Result, StoreError};
use crate::executor::{
    EmbeddingRecord, Executor, FacetOptions, FacetValueCount, MetricMode, RangeSearchOptions,
    SearchHit, SearchOptions,
};
use crate::facets::{CompiledFilter, FilterSpec};
use crate::hnsw::{HnswIndex, HnswParams};
use crate::ivf::{IvfIndex, IvfParams};
use crate::models::{CollectionRow, DocumentRow, EmbeddingRow, IndexSnapshotRow};
use crate::similarity::SimilarityFn;

const DEFAULT_COLLECTION_ID: i32 = 1;
const DEFAULT_COLLECTION_NAME: &str = "default";
const POOL_MAX_SIZE: u32 = 25;
const POOL_MIN_IDLE: u32 = 10;
const POOL_MAX_LIFETIME_SECS: u64 = 2 * 60 * 60;

/// A fully materialized embedding row, as returned to callers.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    pub id: String,
    pub collection_id: i32,
    pub vector: Vec<f32>,
    pub content: String,
    pub doc_id: Option<String>,
    pub metadata: serde_json::Value,
    pub acl: Option<Vec<String>>,
    pub created_at: chrono::NaiveDateTime,
}

/// Fields a caller supplies for an insert/replace.
#[derive(Clone, Debug)]
pub struct NewEmbedding {
    pub id: String,
    pub collection_id: i32,
    pub vector: Vec<f32>,
    pub content: String,
    pub doc_id: Option<String>,
    pub metadata: serde_json::Value,
    pub acl: Option<Vec<String>>,
}

impl NewEmbedding {
    pub fn new(id: impl Into<String>, vector: Vec<f32>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collection_id: DEFAULT_COLLECTION_ID,
            vector,
            content: content.into(),
            doc_id: None,
            metadata: serde_json::json!({}),
            acl: None,
        }
    }
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_to_embedding(row: EmbeddingRow) -> Result<Embedding> {
    let acl = match row.acl {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|e| StoreError::corrupted("get_by_id", e.to_string()))?,
        ),
        None => None,
    };
    let metadata = match row.metadata {
        Some(text) => serde_json::from_str(&text)
            .map_err(|e| StoreError::corrupted("get_by_id", e.to_string()))?,
        None => serde_json::json!({}),
    };
    Ok(Embedding {
        id: row.id,
        collection_id: row.collection_id,
        vector: decode_vector(&row.vector),
        content: row.content,
        doc_id: row.doc_id,
        metadata,
        acl,
        created_at: row.created_at,
    })
}

/// A fully materialized document row, as returned to callers.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub version: i32,
    pub author: Option<String>,
    pub metadata: serde_json::Value,
    pub acl: Option<Vec<String>>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

/// Fields a caller supplies to create or replace a document.
#[derive(Clone, Debug)]
pub struct NewDocument {
    pub id: String,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub author: Option<String>,
    pub metadata: serde_json::Value,
    pub acl: Option<Vec<String>>,
}

impl NewDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            source_url: None,
            author: None,
            metadata: serde_json::json!({}),
            acl: None,
        }
    }
}

fn row_to_document(row: DocumentRow) -> Result<Document> {
    let acl = match row.acl {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|e| StoreError::corrupted("get_document", e.to_string()))?,
        ),
        None => None,
    };
    let metadata = match row.metadata {
        Some(text) => serde_json::from_str(&text)
            .map_err(|e| StoreError::corrupted("get_document", e.to_string()))?,
        None => serde_json::json!({}),
    };
    Ok(Document {
        id: row.id,
        title: row.title,
        source_url: row.source_url,
        version: row.version,
        author: row.author,
        metadata,
        acl,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// If `embedding.acl` is `None` and it belongs to a document, inherit that
/// document's ACL. A missing or unparseable document ACL leaves the
/// embedding's ACL as `None`.
fn inherit_acl(conn: &mut SqliteConnection, mut embedding: Embedding) -> Embedding {
    if embedding.acl.is_none() {
        if let Some(doc_id) = embedding.doc_id.clone() {
            if let Ok(doc_row) = crate::schema::documents::table
                .find(&doc_id)
                .first::<DocumentRow>(conn)
            {
                if let Some(acl_text) = doc_row.acl {
                    embedding.acl = serde_json::from_str(&acl_text).ok();
                }
            }
        }
    }
    embedding
}

struct StoreInner {
    pool: Pool<ConnectionManager<SqliteConnection>>,
    similarity: SimilarityFn,
    dim: usize,
    hnsw: Option<HnswIndex>,
    ivf: Option<IvfIndex>,
    closed: bool,
}

impl StoreInner {
    fn conn(&self, op: &'static str) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool.get().map_err(|e| StoreError::internal(op, e))
    }
}

/// Reapplies the store's pragma set to every connection the pool opens.
///
/// `diesel::r2d2::CustomizeConnection::on_acquire` runs once per physical
/// connection, not once per pool — `foreign_keys` and `busy_timeout` are
/// connection-scoped pragmas in SQLite, so without this every connection
/// beyond the one [`crate::migrations::run`] happened to initialize would
/// silently have `foreign_keys` off and no busy timeout.
#[derive(Debug)]
struct PragmaCustomizer;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        diesel::connection::Connection::batch_execute(conn, crate::migrations::PRAGMAS)
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// `":memory:"` resolves to a private, un-shareable database per connection;
/// a pool of such connections would each see an empty database the moment
/// they weren't the one [`Store::init`] happened to migrate. The
/// shared-cache URI form keeps every pooled connection pointed at the same
/// in-memory database for as long as at least one of them stays open (which
/// `min_idle` guarantees).
fn resolve_connection_string(path: &str) -> String {
    if path == ":memory:" {
        "file::memory:?cache=shared".to_string()
    } else {
        path.to_string()
    }
}

/// An embedded, single-process vector search store backed by a SQLite file.
pub struct Store {
    config: StoreConfig,
    inner: RwLock<Option<StoreInner>>,
}

impl Store {
    /// Construct a store pointed at `path` targeting `vector_dim` (`0` for
    /// auto-detect on first insert), with every other setting at its
    /// default. Touches no disk until [`Store::init`].
    pub fn new(path: impl Into<String>, vector_dim: usize) -> Self {
        let mut config = StoreConfig::new(path);
        config.vector_dim = vector_dim;
        Self::new_with_config(config)
    }

    /// Construct a store from an explicit [`StoreConfig`]. Touches no disk
    /// until [`Store::init`].
    pub fn new_with_config(config: StoreConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(None),
        }
    }

    /// Open the backing file, create schema if absent, insert the default
    /// collection, and bring up the configured ANN indexes (loaded from a
    /// snapshot if one matches the current embedding count, rebuilt
    /// otherwise).
    pub fn init(&self, cancel: &CancellationToken) -> Result<()> {
        cancel.check("init")?;
        let manager =
            ConnectionManager::<SqliteConnection>::new(resolve_connection_string(&self.config.path));
        let pool = Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .min_idle(Some(POOL_MIN_IDLE))
            .max_lifetime(Some(std::time::Duration::from_secs(POOL_MAX_LIFETIME_SECS)))
            .connection_customizer(Box::new(PragmaCustomizer))
            .build(manager)
            .map_err(|e| StoreError::internal("init", e))?;

        let mut conn = pool.get().map_err(|e| StoreError::internal("init", e))?;
        crate::migrations::run(&mut conn, self.config.fts.enabled)?;
        ensure_default_collection(&mut conn)?;

        let stored_dim = current_dimension(&mut conn)?;
        let dim = stored_dim.unwrap_or(self.config.vector_dim);
        if stored_dim.is_none() && dim != 0 {
            diesel::update(crate::schema::collections::table.find(DEFAULT_COLLECTION_ID))
                .set(crate::schema::collections::dimensions.eq(dim as i32))
                .execute(&mut conn)
                .map_err(|e| StoreError::internal("init", e))?;
        }
        let similarity = self.config.similarity_fn.kernel();

        let records = load_all_records(&mut conn)?;

        let hnsw = if self.config.hnsw.enabled {
            Some(build_or_load_hnsw(&mut conn, dim, similarity, &self.config, &records)?)
        } else {
            None
        };
        let ivf = if self.config.ivf.enabled {
            Some(build_or_load_ivf(&mut conn, dim, similarity, &self.config, &records)?)
        } else {
            None
        };

        let mut guard = self.inner.write().expect("store lock poisoned");
        *guard = Some(StoreInner {
            pool,
            similarity,
            dim,
            hnsw,
            ivf,
            closed: false,
        });
        Ok(())
    }

    fn with_inner<T>(&self, op: &'static str, f: impl FnOnce(&StoreInner) -> Result<T>) -> Result<T> {
        let guard = self.inner.read().expect("store lock poisoned");
        match guard.as_ref() {
            Some(inner) if !inner.closed => f(inner),
            _ => Err(StoreError::StoreClosed { op }),
        }
    }

    fn with_inner_mut<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut StoreInner) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.inner.write().expect("store lock poisoned");
        match guard.as_mut() {
            Some(inner) if !inner.closed => f(inner),
            _ => Err(StoreError::StoreClosed { op }),
        }
    }

    /// Insert or replace the embedding by id, adapting its vector to the
    /// collection's dimension, atomically updating the FTS mirror and ANN
    /// indexes with it.
    pub fn upsert(&self, embedding: NewEmbedding, cancel: &CancellationToken) -> Result<()> {
        cancel.check("upsert")?;
        self.with_inner_mut("upsert", |inner| {
            let mut conn = inner.conn("upsert")?;

            let target_dim = if inner.dim == 0 {
                embedding.vector.len()
            } else {
                inner.dim
            };
            let adapted = adapt_vector(
                &embedding.vector,
                target_dim,
                self.config.auto_dim_adapt,
                self.config.auto_normalize,
                "upsert",
            )?;

            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                if inner.dim == 0 {
                    diesel::update(crate::schema::collections::table.find(embedding.collection_id))
                        .set(crate::schema::collections::dimensions.eq(target_dim as i32))
                        .execute(conn)?;
                }

                let now = chrono::Utc::now().naive_utc();

                // Lazily create the referenced document so the embedding's
                // `doc_id` foreign key is satisfied without requiring a
                // separate `upsert_document` call first.
                if let Some(doc_id) = &embedding.doc_id {
                    let placeholder = DocumentRow {
                        id: doc_id.clone(),
                        title: None,
                        source_url: None,
                        version: 1,
                        author: None,
                        metadata: None,
                        acl: None,
                        created_at: now,
                        updated_at: now,
                    };
                    diesel::insert_into(crate::schema::documents::table)
                        .values(&placeholder)
                        .on_conflict(crate::schema::documents::id)
                        .do_nothing()
                        .execute(conn)?;
                }

                let row = EmbeddingRow {
                    id: embedding.id.clone(),
                    collection_id: embedding.collection_id,
                    vector: encode_vector(&adapted),
                    content: embedding.content.clone(),
                    doc_id: embedding.doc_id.clone(),
                    metadata: Some(embedding.metadata.to_string()),
                    acl: embedding.acl.as_ref().map(|a| serde_json::to_string(a).unwrap_or_default()),
                    created_at: now,
                };
                diesel::insert_into(crate::schema::embeddings::table)
                    .values(&row)
                    .on_conflict(crate::schema::embeddings::id)
                    .do_update()
                    .set(&row)
                    .execute(conn)?;
                Ok(())
            })
            .map_err(|e| from_diesel("upsert", &embedding.id, e))?;

            inner.dim = target_dim;
            if let Some(hnsw) = inner.hnsw.as_mut() {
                hnsw.insert(&embedding.id, adapted.clone());
                if hnsw.needs_rebuild() {
                    hnsw.rebuild();
                }
            }
            if let Some(ivf) = inner.ivf.as_mut() {
                ivf.insert(&embedding.id, adapted);
            }
            Ok(())
        })
    }

    /// Fetch one embedding by id. Its ACL is inherited from the parent
    /// document when the embedding's own `acl` is `None`.
    pub fn get_by_id(&self, id: &str, cancel: &CancellationToken) -> Result<Embedding> {
        cancel.check("get_by_id")?;
        self.with_inner("get_by_id", |inner| {
            let mut conn = inner.conn("get_by_id")?;
            let row: EmbeddingRow = crate::schema::embeddings::table
                .find(id)
                .first(&mut conn)
                .map_err(|e| from_diesel("get_by_id", id, e))?;
            let embedding = row_to_embedding(row)?;
            Ok(inherit_acl(&mut conn, embedding))
        })
    }

    /// Create a new collection explicitly, failing if the name is already
    /// taken. Returns the new collection's id. `default` (id=1) is created
    /// automatically by [`Store::init`]; this is for every additional
    /// collection a caller wants up front rather than lazily via
    /// [`NewEmbedding::collection_id`].
    pub fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        description: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<i32> {
        self.with_inner_mut("create_collection", |inner| {
            let mut conn = inner.conn("create_collection")?;
            let exists: bool = diesel::select(diesel::dsl::exists(
                crate::schema::collections::table.filter(crate::schema::collections::name.eq(name)),
            ))
            .get_result(&mut conn)
            .map_err(|e| StoreError::internal("create_collection", e))?;
            if exists {
                return Err(StoreError::AlreadyExists {
                    op: "create_collection",
                    id: name.to_string(),
                });
            }

            let now = chrono::Utc::now().naive_utc();
            let row = CollectionRow {
                id: None,
                name: name.to_string(),
                dimensions: dimensions as i32,
                description,
                metadata: Some(metadata.to_string()),
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(crate::schema::collections::table)
                .values(&row)
                .execute(&mut conn)
                .map_err(|e| StoreError::internal("create_collection", e))?;

            crate::schema::collections::table
                .filter(crate::schema::collections::name.eq(name))
                .select(crate::schema::collections::id)
                .first(&mut conn)
                .map_err(|e| StoreError::internal("create_collection", e))
        })
    }

    /// Create or replace a document's descriptive fields (title, source URL,
    /// author, metadata, ACL). Does not touch `version`, which only the store
    /// itself advances. Documents are also created lazily by [`Store::upsert`]
    /// when an embedding references a `doc_id` that does not yet exist; this
    /// method is for callers that want to set those fields up front.
    pub fn upsert_document(&self, document: NewDocument) -> Result<()> {
        self.with_inner_mut("upsert_document", |inner| {
            let mut conn = inner.conn("upsert_document")?;
            let now = chrono::Utc::now().naive_utc();
            let row = DocumentRow {
                id: document.id.clone(),
                title: document.title,
                source_url: document.source_url,
                version: 1,
                author: document.author,
                metadata: Some(document.metadata.to_string()),
                acl: document
                    .acl
                    .as_ref()
                    .map(|a| serde_json::to_string(a).unwrap_or_default()),
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(crate::schema::documents::table)
                .values(&row)
                .on_conflict(crate::schema::documents::id)
                .do_update()
                .set((
                    crate::schema::documents::title.eq(&row.title),
                    crate::schema::documents::source_url.eq(&row.source_url),
                    crate::schema::documents::author.eq(&row.author),
                    crate::schema::documents::metadata.eq(&row.metadata),
                    crate::schema::documents::acl.eq(&row.acl),
                    crate::schema::documents::updated_at.eq(&row.updated_at),
                ))
                .execute(&mut conn)
                .map_err(|e| from_diesel("upsert_document", &document.id, e))?;
            Ok(())
        })
    }

    /// Fetch one document by id.
    pub fn get_document(&self, id: &str, cancel: &CancellationToken) -> Result<Document> {
        cancel.check("get_document")?;
        self.with_inner("get_document", |inner| {
            let mut conn = inner.conn("get_document")?;
            let row: DocumentRow = crate::schema::documents::table
                .find(id)
                .first(&mut conn)
                .map_err(|e| from_diesel("get_document", id, e))?;
            row_to_document(row)
        })
    }

    /// Delete a document, cascading to every embedding that references it.
    /// The relational cascade is enforced by the schema's `ON DELETE CASCADE`;
    /// this also propagates the deletion to the live ANN indexes, which the
    /// cascade cannot reach on its own.
    pub fn delete_document(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        cancel.check("delete_document")?;
        self.with_inner_mut("delete_document", |inner| {
            let mut conn = inner.conn("delete_document")?;
            let affected_embeddings: Vec<String> = crate::schema::embeddings::table
                .filter(crate::schema::embeddings::doc_id.eq(id))
                .select(crate::schema::embeddings::id)
                .load(&mut conn)
                .map_err(|e| StoreError::internal("delete_document", e))?;

            let affected = diesel::delete(crate::schema::documents::table.find(id))
                .execute(&mut conn)
                .map_err(|e| from_diesel("delete_document", id, e))?;
            if affected == 0 {
                return Err(StoreError::NotFound {
                    op: "delete_document",
                    id: id.to_string(),
                });
            }

            for embedding_id in &affected_embeddings {
                if let Some(hnsw) = inner.hnsw.as_mut() {
                    hnsw.delete(embedding_id);
                }
                if let Some(ivf) = inner.ivf.as_mut() {
                    ivf.delete(embedding_id);
                }
            }
            if let Some(hnsw) = inner.hnsw.as_mut() {
                if hnsw.needs_rebuild() {
                    hnsw.rebuild();
                }
            }
            Ok(())
        })
    }

    /// Remove an embedding and propagate the deletion to the ANN indexes.
    pub fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        cancel.check("delete")?;
        self.with_inner_mut("delete", |inner| {
            let mut conn = inner.conn("delete")?;
            let affected = diesel::delete(crate::schema::embeddings::table.find(id))
                .execute(&mut conn)
                .map_err(|e| from_diesel("delete", id, e))?;
            if affected == 0 {
                return Err(StoreError::NotFound { op: "delete", id: id.to_string() });
            }
            if let Some(hnsw) = inner.hnsw.as_mut() {
                hnsw.delete(id);
                if hnsw.needs_rebuild() {
                    hnsw.rebuild();
                }
            }
            if let Some(ivf) = inner.ivf.as_mut() {
                ivf.delete(id);
            }
            Ok(())
        })
    }

    /// Yield every embedding in `collection_id` matching `filter` (no
    /// filter = every embedding), suitable for streaming dumps and
    /// brute-force fallback.
    pub fn iterate(
        &self,
        collection_id: Option<i32>,
        filter: Option<Vec<(String, FilterSpec)>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Embedding>> {
        cancel.check("iterate")?;
        self.with_inner("iterate", |inner| {
            let mut conn = inner.conn("iterate")?;
            let rows = load_rows(&mut conn, collection_id)?;
            let compiled = match filter {
                Some(f) => Some(CompiledFilter::compile(f)?),
                None => None,
            };
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let embedding = row_to_embedding(row)?;
                if compiled.as_ref().is_none_or(|c| c.evaluate(&embedding.metadata)) {
                    out.push(inherit_acl(&mut conn, embedding));
                }
            }
            Ok(out)
        })
    }

    fn executor_records(&self, inner: &StoreInner, collection_id: Option<i32>) -> Result<Vec<EmbeddingRecord>> {
        let mut conn = inner.conn("search")?;
        let rows = load_rows(&mut conn, collection_id)?;
        rows.into_iter()
            .map(|row| {
                let metadata = match &row.metadata {
                    Some(text) => serde_json::from_str(text)
                        .map_err(|e| StoreError::corrupted("search", e.to_string()))?,
                    None => serde_json::json!({}),
                };
                Ok(EmbeddingRecord {
                    id: row.id,
                    vector: decode_vector(&row.vector),
                    content: row.content,
                    metadata,
                })
            })
            .collect()
    }

    /// Top-K similarity search.
    pub fn search(
        &self,
        query: &[f32],
        collection_id: Option<i32>,
        opts: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        self.with_inner("search", |inner| {
            let adapted = adapt_vector(
                query,
                inner.dim,
                self.config.auto_dim_adapt,
                self.config.auto_normalize,
                "search",
            )?;
            let records = self.executor_records(inner, collection_id)?;
            let executor = Executor::new(
                &records,
                inner.hnsw.as_ref(),
                inner.ivf.as_ref(),
                inner.similarity,
                self.config.hnsw_min_collection_size,
            );
            executor.search(&adapted, opts, cancel)
        })
    }

    /// Radius search.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        collection_id: Option<i32>,
        opts: &RangeSearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        self.with_inner("range_search", |inner| {
            let adapted = adapt_vector(
                query,
                inner.dim,
                self.config.auto_dim_adapt,
                self.config.auto_normalize,
                "range_search",
            )?;
            let records = self.executor_records(inner, collection_id)?;
            let executor = Executor::new(
                &records,
                inner.hnsw.as_ref(),
                inner.ivf.as_ref(),
                inner.similarity,
                self.config.hnsw_min_collection_size,
            );
            executor.range_search(&adapted, radius, opts, cancel)
        })
    }

    /// `Search` plus per-field facet histograms.
    pub fn search_with_facets(
        &self,
        query: &[f32],
        collection_id: Option<i32>,
        opts: &SearchOptions,
        facet_opts: &FacetOptions,
        cancel: &CancellationToken,
    ) -> Result<(Vec<SearchHit>, std::collections::HashMap<String, Vec<FacetValueCount>>)> {
        self.with_inner("search_with_facets", |inner| {
            let adapted = adapt_vector(
                query,
                inner.dim,
                self.config.auto_dim_adapt,
                self.config.auto_normalize,
                "search_with_facets",
            )?;
            let records = self.executor_records(inner, collection_id)?;
            let executor = Executor::new(
                &records,
                inner.hnsw.as_ref(),
                inner.ivf.as_ref(),
                inner.similarity,
                self.config.hnsw_min_collection_size,
            );
            executor.search_with_facets(&adapted, opts, facet_opts, cancel)
        })
    }

    /// Blend vector similarity with FTS `bm25` relevance. Runs the FTS query itself to produce `fts_scores`
    /// (negating SQLite's lower-is-better `bm25()` into higher-is-better).
    pub fn hybrid_search(
        &self,
        query: &[f32],
        text: &str,
        alpha: f32,
        collection_id: Option<i32>,
        opts: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        self.with_inner("hybrid_search", |inner| {
            if !self.config.fts.enabled {
                return Err(StoreError::invalid(
                    "hybrid_search",
                    "FTS is disabled in this store's configuration (config.fts.enabled = false)",
                ));
            }
            let adapted = adapt_vector(
                query,
                inner.dim,
                self.config.auto_dim_adapt,
                self.config.auto_normalize,
                "hybrid_search",
            )?;
            let mut conn = inner.conn("hybrid_search")?;
            let fts_scores = fts_candidate_scores(&mut conn, text)?;
            let records = self.executor_records(inner, collection_id)?;
            let executor = Executor::new(
                &records,
                inner.hnsw.as_ref(),
                inner.ivf.as_ref(),
                inner.similarity,
                self.config.hnsw_min_collection_size,
            );
            executor.hybrid_search(&adapted, &fts_scores, alpha, opts, cancel)
        })
    }

    /// Sequential fan-out of [`Store::search`] within one critical section
    ///.
    pub fn batch_search(
        &self,
        queries: &[Vec<f32>],
        collection_id: Option<i32>,
        opts: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<SearchHit>>> {
        self.with_inner("batch_search", |inner| {
            let records = self.executor_records(inner, collection_id)?;
            let executor = Executor::new(
                &records,
                inner.hnsw.as_ref(),
                inner.ivf.as_ref(),
                inner.similarity,
                self.config.hnsw_min_collection_size,
            );
            let mut adapted_queries = Vec::with_capacity(queries.len());
            for q in queries {
                adapted_queries.push(adapt_vector(
                    q,
                    inner.dim,
                    self.config.auto_dim_adapt,
                    self.config.auto_normalize,
                    "batch_search",
                )?);
            }
            executor.batch_search(&adapted_queries, opts, cancel)
        })
    }

    /// Sequential fan-out of [`Store::range_search`].
    pub fn batch_range_search(
        &self,
        queries: &[Vec<f32>],
        radius: f32,
        collection_id: Option<i32>,
        opts: &RangeSearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<SearchHit>>> {
        self.with_inner("batch_range_search", |inner| {
            let records = self.executor_records(inner, collection_id)?;
            let executor = Executor::new(
                &records,
                inner.hnsw.as_ref(),
                inner.ivf.as_ref(),
                inner.similarity,
                self.config.hnsw_min_collection_size,
            );
            let mut adapted_queries = Vec::with_capacity(queries.len());
            for q in queries {
                adapted_queries.push(adapt_vector(
                    q,
                    inner.dim,
                    self.config.auto_dim_adapt,
                    self.config.auto_normalize,
                    "batch_range_search",
                )?);
            }
            executor.batch_range_search(&adapted_queries, radius, opts, cancel)
        })
    }

    /// Serialize the live HNSW/IVF indexes into `index_snapshots` without
    /// closing the store.
    pub fn snapshot(&self) -> Result<()> {
        self.with_inner("snapshot", |inner| {
            let mut conn = inner.conn("snapshot")?;
            let now = chrono::Utc::now().naive_utc();
            if let Some(hnsw) = &inner.hnsw {
                write_snapshot(&mut conn, "hnsw", hnsw.to_bytes(), now)?;
            }
            if let Some(ivf) = &inner.ivf {
                write_snapshot(&mut conn, "ivf", ivf.to_bytes(), now)?;
            }
            Ok(())
        })
    }

    /// Flush index snapshots, close the connection pool, and mark the store
    /// closed; every subsequent operation fails with [`StoreError::StoreClosed`].
    pub fn close(&self) -> Result<()> {
        self.snapshot()?;
        let mut guard = self.inner.write().expect("store lock poisoned");
        if let Some(inner) = guard.as_mut() {
            inner.closed = true;
        }
        Ok(())
    }

    /// Resolve a collection id to its name, for labeling dump output.
    pub fn collection_name(&self, collection_id: i32) -> Result<String> {
        self.with_inner("collection_name", |inner| {
            let mut conn = inner.conn("collection_name")?;
            crate::schema::collections::table
                .find(collection_id)
                .select(crate::schema::collections::name)
                .first(&mut conn)
                .map_err(|e| from_diesel("collection_name", collection_id, e))
        })
    }

    /// Resolve a collection name to its id, for scoping loaded embeddings.
    pub fn collection_id_by_name(&self, name: &str) -> Result<i32> {
        self.with_inner("collection_id_by_name", |inner| {
            let mut conn = inner.conn("collection_id_by_name")?;
            crate::schema::collections::table
                .filter(crate::schema::collections::name.eq(name))
                .select(crate::schema::collections::id)
                .first(&mut conn)
                .map_err(|e| from_diesel("collection_id_by_name", name, e))
        })
    }

    /// Produce a byte-identical copy of the backing relational file at
    /// `dest_path` via SQLite's `VACUUM INTO`, its online-backup-equivalent
    /// single-statement form; a read lock is held for the duration so
    /// writers observe it as one atomic point.
    pub fn backup(&self, dest_path: impl AsRef<Path>) -> Result<()> {
        self.with_inner("backup", |inner| {
            let mut conn = inner.conn("backup")?;
            let dest = dest_path
                .as_ref()
                .to_str()
                .ok_or_else(|| StoreError::invalid("backup", "destination path is not valid UTF-8"))?;
            diesel::sql_query(format!("VACUUM INTO '{}'", dest.replace('\'', "''")))
                .execute(&mut *conn)
                .map_err(|e| StoreError::internal("backup", e))?;
            Ok(())
        })
    }
}

fn write_snapshot(conn: &mut SqliteConnection, kind: &str, data: Vec<u8>, now: chrono::NaiveDateTime) -> Result<()> {
    let row = IndexSnapshotRow {
        kind: kind.to_string(),
        data,
        created_at: now,
    };
    diesel::insert_into(crate::schema::index_snapshots::table)
        .values(&row)
        .on_conflict(crate::schema::index_snapshots::kind)
        .do_update()
        .set(&row)
        .execute(conn)
        .map_err(|e| StoreError::internal("snapshot", e))?;
    Ok(())
}

fn ensure_default_collection(conn: &mut SqliteConnection) -> Result<()> {
    let exists: bool = diesel::select(diesel::dsl::exists(
        crate::schema::collections::table.find(DEFAULT_COLLECTION_ID),
    ))
    .get_result(conn)
    .map_err(|e| StoreError::internal("init", e))?;
    if exists {
        return Ok(());
    }
    let now = chrono::Utc::now().naive_utc();
    let row = CollectionRow {
        id: Some(DEFAULT_COLLECTION_ID),
        name: DEFAULT_COLLECTION_NAME.to_string(),
        dimensions: 0,
        description: None,
        metadata: None,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(crate::schema::collections::table)
        .values(&row)
        .execute(conn)
        .map_err(|e| StoreError::internal("init", e))?;
    Ok(())
}

fn current_dimension(conn: &mut SqliteConnection) -> Result<Option<usize>> {
    let dims: i32 = crate::schema::collections::table
        .find(DEFAULT_COLLECTION_ID)
        .select(crate::schema::collections::dimensions)
        .first(conn)
        .map_err(|e| StoreError::internal("init", e))?;
    Ok(if dims > 0 { Some(dims as usize) } else { None })
}

fn load_rows(conn: &mut SqliteConnection, collection_id: Option<i32>) -> Result<Vec<EmbeddingRow>> {
    let mut query = crate::schema::embeddings::table.into_boxed();
    if let Some(cid) = collection_id {
        query = query.filter(crate::schema::embeddings::collection_id.eq(cid));
    }
    query
        .load(conn)
        .map_err(|e| StoreError::internal("iterate", e))
}

fn load_all_records(conn: &mut SqliteConnection) -> Result<Vec<EmbeddingRecordSeed>> {
    let rows = load_rows(conn, None)?;
    Ok(rows
        .into_iter()
        .map(|row| EmbeddingRecordSeed {
            id: row.id,
            vector: decode_vector(&row.vector),
        })
        .collect())
}

struct EmbeddingRecordSeed {
    id: String,
    vector: Vec<f32>,
}

fn build_or_load_hnsw(
    conn: &mut SqliteConnection,
    dim: usize,
    similarity: SimilarityFn,
    config: &StoreConfig,
    records: &[EmbeddingRecordSeed],
) -> Result<HnswIndex> {
    let snapshot: Option<IndexSnapshotRow> = crate::schema::index_snapshots::table
        .find("hnsw")
        .first(conn)
        .optional()
        .map_err(|e| StoreError::internal("init", e))?;

    if let Some(snapshot) = snapshot {
        if let Ok(index) = HnswIndex::from_bytes(&snapshot.data, similarity) {
            if index.len() == records.len() {
                return Ok(index);
            }
        }
    }

    let params = HnswParams::new(config.hnsw.m, config.hnsw.ef_construction, config.hnsw.ef_search);
    let mut index = HnswIndex::new(dim, similarity, params);
    for record in records {
        index.insert(&record.id, record.vector.clone());
    }
    Ok(index)
}

/// Load the `"ivf"` snapshot row if one exists and still matches the
/// current embedding count, otherwise rebuild from scratch — the same
/// load-then-fallback pattern as [`build_or_load_hnsw`].
fn build_or_load_ivf(
    conn: &mut SqliteConnection,
    dim: usize,
    similarity: SimilarityFn,
    config: &StoreConfig,
    records: &[EmbeddingRecordSeed],
) -> Result<IvfIndex> {
    let snapshot: Option<IndexSnapshotRow> = crate::schema::index_snapshots::table
        .find("ivf")
        .first(conn)
        .optional()
        .map_err(|e| StoreError::internal("init", e))?;

    if let Some(snapshot) = snapshot {
        if let Ok(index) = IvfIndex::from_bytes(&snapshot.data, similarity) {
            if index.len() == records.len() {
                return Ok(index);
            }
        }
    }

    let mut index = IvfIndex::new(
        dim,
        similarity,
        IvfParams {
            n_clusters: config.ivf.n_clusters,
            n_probe: config.ivf.n_probe,
        },
    );
    let items = records.iter().map(|r| (r.id.clone(), r.vector.clone())).collect();
    index.build(items);
    Ok(index)
}

/// Run `text` as an FTS5 `MATCH` query and return each matching embedding's
/// id mapped to a higher-is-better score (SQLite's `bm25()` is negative and
/// lower-is-better, so it is negated here before returning).
fn fts_candidate_scores(
    conn: &mut SqliteConnection,
    text: &str,
) -> Result<std::collections::HashMap<String, f32>> {
    #[derive(QueryableByName)]
    struct Row {
        #[diesel(sql_type = diesel::sql_types::Text)]
        id: String,
        #[diesel(sql_type = diesel::sql_types::Double)]
        rank: f64,
    }

    let rows: Vec<Row> = diesel::sql_query(
        "SELECT e.id AS id, bm25(chunks_fts) AS rank \
         FROM chunks_fts JOIN embeddings e ON e.rowid = chunks_fts.rowid \
         WHERE chunks_fts MATCH ?",
    )
    .bind::<diesel::sql_types::Text, _>(text)
    .load(conn)
    .map_err(|e| StoreError::internal("hybrid_search", e))?;

    Ok(rows
        .into_iter()
        .map(|r| (r.id, -(r.rank as f32)))
        .collect())
}
