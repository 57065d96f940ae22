// @generated manually to match src/migrations.rs — see DESIGN.md.
//
// `chunks_fts` (an FTS5 virtual table) and its sync triggers cannot be
// expressed with the `table!` macro and are created directly by
// `crate::migrations::run` via raw SQL.

diesel::table! {
    collections (id) {
        id -> Integer,
        name -> Text,
        dimensions -> Integer,
        description -> Nullable<Text>,
        metadata -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    documents (id) {
        id -> Text,
        title -> Nullable<Text>,
        source_url -> Nullable<Text>,
        version -> Integer,
        author -> Nullable<Text>,
        metadata -> Nullable<Text>,
        acl -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    embeddings (id) {
        id -> Text,
        collection_id -> Integer,
        vector -> Binary,
        content -> Text,
        doc_id -> Nullable<Text>,
        metadata -> Nullable<Text>,
        acl -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    index_snapshots (kind) {
        kind -> Text,
        data -> Binary,
        created_at -> Timestamp,
    }
}

diesel::table! {
    conversations (id) {
        id -> Integer,
        session_name -> Text,
    }
}

diesel::table! {
    messages (id) {
        id -> Integer,
        role -> Text,
        content -> Text,
        dynamic -> Bool,
        conversation_id -> Nullable<Integer>,
    }
}

diesel::joinable!(embeddings -> collections (collection_id));
diesel::joinable!(embeddings -> documents (doc_id));
diesel::joinable!(messages -> conversations (conversation_id));

diesel::allow_tables_to_appear_in_same_query!(
    collections,
    documents,
    embeddings,
    index_snapshots,
    conversations,
    messages,
);
