//! # Sessions / Messages (sibling schema)
//!
//! A sibling chat-history schema, kept purely for referential consistency
//! with the rest of the database — only its existence is guaranteed here.
//! No search, ranking, or token-budgeting logic is built on it; that scope
//! lives outside this crate (see `DESIGN.md`).
//!
//! What remains is the minimum needed to exercise the `conversations`/
//! `messages` tables: find-or-create a named conversation and append/list
//! its messages.

use diesel::prelude::*;
use diesel::SqliteConnection;

use crate::error::{from_diesel, Result};
use crate::models::{Conversation, Message};

/// Find the conversation named `session_name`, creating it if absent.
pub fn ensure_conversation(conn: &mut SqliteConnection, session_name: &str) -> Result<Conversation> {
    let existing: Option<Conversation> = crate::schema::conversations::table
        .filter(crate::schema::conversations::session_name.eq(session_name))
        .first(conn)
        .optional()
        .map_err(|e| from_diesel("ensure_conversation", session_name, e))?;

    if let Some(conversation) = existing {
        return Ok(conversation);
    }

    let new_conversation = Conversation {
        id: None,
        session_name: session_name.to_string(),
    };
    diesel::insert_into(crate::schema::conversations::table)
        .values(&new_conversation)
        .returning(Conversation::as_returning())
        .get_result(conn)
        .map_err(|e| from_diesel("ensure_conversation", session_name, e))
}

/// Append a message to `conversation`.
pub fn insert_message(
    conn: &mut SqliteConnection,
    conversation: &Conversation,
    role: &str,
    content: &str,
) -> Result<Message> {
    let message = Message {
        id: None,
        role: role.to_string(),
        content: content.to_string(),
        dynamic: false,
        conversation_id: conversation.id,
    };

    diesel::insert_into(crate::schema::messages::table)
        .values(&message)
        .returning(Message::as_returning())
        .get_result(conn)
        .map_err(|e| from_diesel("insert_message", &conversation.session_name, e))
}

/// List every message belonging to `conversation`, in insertion order.
pub fn list_messages(conn: &mut SqliteConnection, conversation: &Conversation) -> Result<Vec<Message>> {
    crate::schema::messages::table
        .filter(crate::schema::messages::conversation_id.eq(conversation.id))
        .order(crate::schema::messages::id.asc())
        .load(conn)
        .map_err(|e| from_diesel("list_messages", &conversation.session_name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::Connection;

    fn memory_conn() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        crate::migrations::run(&mut conn).unwrap();
        conn
    }

    #[test]
    fn ensure_conversation_is_idempotent() {
        let mut conn = memory_conn();
        let a = ensure_conversation(&mut conn, "demo").unwrap();
        let b = ensure_conversation(&mut conn, "demo").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn messages_round_trip_in_order() {
        let mut conn = memory_conn();
        let convo = ensure_conversation(&mut conn, "demo").unwrap();
        insert_message(&mut conn, &convo, "user", "hello").unwrap();
        insert_message(&mut conn, &convo, "assistant", "hi there").unwrap();

        let messages = list_messages(&mut conn, &convo).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "hi there");
    }

    #[test]
    fn messages_are_scoped_to_their_conversation() {
        let mut conn = memory_conn();
        let a = ensure_conversation(&mut conn, "a").unwrap();
        let b = ensure_conversation(&mut conn, "b").unwrap();
        insert_message(&mut conn, &a, "user", "in a").unwrap();

        assert_eq!(list_messages(&mut conn, &a).unwrap().len(), 1);
        assert_eq!(list_messages(&mut conn, &b).unwrap().len(), 0);
    }
}
