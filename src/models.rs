//! # Diesel models
//!
//! One `Queryable`/`Insertable` struct per table in `src/schema.rs`. These are
//! thin, non-normative mirrors of the relational rows — the public `Store`
//! API (`src/store.rs`) never leaks them directly, converting to/from the
//! richer `Embedding`/`Collection`/`Document` types instead.
//!
//! `Conversation` and `Message` are carried over unchanged from the sibling
//! chat-history schema; nothing in this crate builds search or ranking logic
//! on top of them.

use diesel::prelude::*;

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::collections)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CollectionRow {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub name: String,
    pub dimensions: i32,
    pub description: Option<String>,
    pub metadata: Option<String>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::documents)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DocumentRow {
    pub id: String,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub version: i32,
    pub author: Option<String>,
    pub metadata: Option<String>,
    pub acl: Option<String>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

#[derive(Queryable, Identifiable, Insertable, Associations, AsChangeset, Debug, Selectable, Clone)]
#[diesel(belongs_to(CollectionRow, foreign_key = collection_id))]
#[diesel(table_name = crate::schema::embeddings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EmbeddingRow {
    pub id: String,
    pub collection_id: i32,
    pub vector: Vec<u8>,
    pub content: String,
    pub doc_id: Option<String>,
    pub metadata: Option<String>,
    pub acl: Option<String>,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::index_snapshots)]
#[diesel(primary_key(kind))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct IndexSnapshotRow {
    pub kind: String,
    pub data: Vec<u8>,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(Queryable, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Conversation {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub session_name: String,
}

#[derive(Queryable, Associations, Insertable, Debug, Selectable, Clone)]
#[diesel(belongs_to(Conversation))]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub role: String,
    pub content: String,
    pub dynamic: bool,
    pub conversation_id: Option<i32>,
}
