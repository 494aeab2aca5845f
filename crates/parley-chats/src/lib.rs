//! Durable store for Parley: users, chats, memberships, and messages.
//!
//! Plain query functions over a `rusqlite::Connection`. Callers own pooling
//! and threading; in the server every call site goes through
//! `tokio::task::spawn_blocking`.
//!
//! Messages are immutable once created. A chat's `updated_at` is touched on
//! every new message so `list_chats_for_user` can sort by recency. Direct
//! chats are the only chat kind: exactly two members at creation, and the
//! chat is deleted (cascading to members and messages) when the last member
//! leaves.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

/// A user's public profile. Never carries the password hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,
    /// Creation timestamp (ISO 8601).
    pub created_at: String,
}

/// A user row together with its stored credential, for login verification.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: User,
    /// `None` for accounts created through federated login only.
    pub password_hash: Option<String>,
}

/// Parameters for creating a new user account.
#[derive(Debug, Clone)]
pub struct CreateUserParams {
    pub id: String,
    pub email: String,
    /// `None` for federated accounts.
    pub password_hash: Option<String>,
    pub name: String,
    pub avatar_url: Option<String>,
}

/// A chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A chat with the denormalized data a listing needs: member profiles and
/// the most recent message, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatOverview {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub members: Vec<User>,
    pub last_message: Option<Message>,
}

/// A message, joined with the sender's display fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub body: String,
    /// Creation timestamp (ISO 8601, millisecond precision).
    pub created_at: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
}

/// Parameters for creating a new message.
#[derive(Debug, Clone)]
pub struct CreateMessageParams {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub body: String,
}

/// Default page size for message history.
pub const DEFAULT_HISTORY_LIMIT: u32 = 200;
/// Hard ceiling for message history page size.
pub const MAX_HISTORY_LIMIT: u32 = 1000;

fn map_row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        avatar_url: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        body: row.get(3)?,
        created_at: row.get(4)?,
        sender_name: row.get(5)?,
        sender_avatar_url: row.get(6)?,
    })
}

/// Creates a new user account.
///
/// A duplicate email surfaces as `StoreError::Database` with a constraint
/// violation; callers map that to a conflict response.
pub fn create_user(conn: &Connection, params: &CreateUserParams) -> Result<User, StoreError> {
    conn.execute(
        "INSERT INTO users (id, email, password_hash, name, avatar_url)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            params.id,
            params.email,
            params.password_hash,
            params.name,
            params.avatar_url,
        ],
    )?;
    get_user(conn, &params.id)
}

/// Retrieves a user's public profile by id.
pub fn get_user(conn: &Connection, user_id: &str) -> Result<User, StoreError> {
    conn.query_row(
        "SELECT id, email, name, avatar_url, created_at FROM users WHERE id = ?1",
        [user_id],
        map_row_to_user,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(user_id.to_string()))
}

/// Looks up a user and stored password hash by email. Returns `None` when no
/// account exists for the address.
pub fn find_credentials_by_email(
    conn: &Connection,
    email: &str,
) -> Result<Option<Credentials>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, email, name, avatar_url, created_at, password_hash
             FROM users WHERE email = ?1",
            [email],
            |row| {
                Ok(Credentials {
                    user: map_row_to_user(row)?,
                    password_hash: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Gets or creates an account for a federated (Google) login.
///
/// An existing account keeps its password hash but has its profile refreshed
/// from the identity provider; a new account is created with no password.
pub fn upsert_federated_user(
    conn: &Connection,
    id_if_new: &str,
    email: &str,
    name: &str,
    avatar_url: Option<&str>,
) -> Result<User, StoreError> {
    conn.execute(
        "INSERT INTO users (id, email, password_hash, name, avatar_url)
         VALUES (?1, ?2, NULL, ?3, ?4)
         ON CONFLICT (email) DO UPDATE SET name = ?3, avatar_url = ?4",
        params![id_if_new, email, name, avatar_url],
    )?;
    conn.query_row(
        "SELECT id, email, name, avatar_url, created_at FROM users WHERE email = ?1",
        [email],
        map_row_to_user,
    )
    .map_err(StoreError::Database)
}

/// Lists all users, newest first.
pub fn list_users(conn: &Connection) -> Result<Vec<User>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, email, name, avatar_url, created_at
         FROM users ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map([], map_row_to_user)?;
    let mut users = Vec::new();
    for row in rows {
        users.push(row?);
    }
    Ok(users)
}

/// Finds an existing chat containing both users, if any.
pub fn find_direct_chat(
    conn: &Connection,
    user_a: &str,
    user_b: &str,
) -> Result<Option<String>, StoreError> {
    let chat_id = conn
        .query_row(
            "SELECT c.id FROM chats c
             WHERE EXISTS (SELECT 1 FROM chat_members WHERE chat_id = c.id AND user_id = ?1)
               AND EXISTS (SELECT 1 FROM chat_members WHERE chat_id = c.id AND user_id = ?2)
             LIMIT 1",
            [user_a, user_b],
            |row| row.get(0),
        )
        .optional()?;
    Ok(chat_id)
}

/// Creates a direct chat between two users.
pub fn create_direct_chat(
    conn: &Connection,
    chat_id: &str,
    user_a: &str,
    user_b: &str,
) -> Result<Chat, StoreError> {
    conn.execute("INSERT INTO chats (id) VALUES (?1)", [chat_id])?;
    conn.execute(
        "INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2), (?1, ?3)",
        params![chat_id, user_a, user_b],
    )?;
    get_chat(conn, chat_id)
}

/// Retrieves a chat by id.
pub fn get_chat(conn: &Connection, chat_id: &str) -> Result<Chat, StoreError> {
    conn.query_row(
        "SELECT id, created_at, updated_at FROM chats WHERE id = ?1",
        [chat_id],
        |row| {
            Ok(Chat {
                id: row.get(0)?,
                created_at: row.get(1)?,
                updated_at: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))
}

/// Lists the member profiles of a chat, in join order.
pub fn list_chat_members(conn: &Connection, chat_id: &str) -> Result<Vec<User>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.email, u.name, u.avatar_url, u.created_at
         FROM chat_members m JOIN users u ON u.id = m.user_id
         WHERE m.chat_id = ?1 ORDER BY m.joined_at ASC, m.id ASC",
    )?;
    let rows = stmt.query_map([chat_id], map_row_to_user)?;
    let mut members = Vec::new();
    for row in rows {
        members.push(row?);
    }
    Ok(members)
}

/// Lists the chats a user belongs to, most recently updated first, each with
/// member profiles and the latest message.
pub fn list_chats_for_user(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<ChatOverview>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.created_at, c.updated_at
         FROM chats c JOIN chat_members m ON m.chat_id = c.id
         WHERE m.user_id = ?1
         ORDER BY c.updated_at DESC, c.rowid DESC",
    )?;
    let rows = stmt.query_map([user_id], |row| {
        Ok(Chat {
            id: row.get(0)?,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
        })
    })?;

    let mut chats = Vec::new();
    for row in rows {
        let chat = row?;
        let members = list_chat_members(conn, &chat.id)?;
        let last_message = latest_message(conn, &chat.id)?;
        chats.push(ChatOverview {
            id: chat.id,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
            members,
            last_message,
        });
    }
    Ok(chats)
}

/// Checks whether a user is a member of a chat. This is the sole
/// authorization gate for posting and reading messages.
pub fn is_member(conn: &Connection, chat_id: &str, user_id: &str) -> Result<bool, StoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM chat_members WHERE chat_id = ?1 AND user_id = ?2)",
        [chat_id, user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Creates a new message with a server-assigned timestamp and returns the
/// persisted row joined with the sender's display fields.
pub fn create_message(
    conn: &Connection,
    params: &CreateMessageParams,
) -> Result<Message, StoreError> {
    conn.execute(
        "INSERT INTO messages (id, chat_id, sender_id, body) VALUES (?1, ?2, ?3, ?4)",
        params![params.id, params.chat_id, params.sender_id, params.body],
    )?;
    conn.query_row(
        "SELECT m.id, m.chat_id, m.sender_id, m.body, m.created_at, u.name, u.avatar_url
         FROM messages m JOIN users u ON u.id = m.sender_id
         WHERE m.id = ?1",
        [&params.id],
        map_row_to_message,
    )
    .map_err(StoreError::Database)
}

/// Clamps a requested history page size to `[1, MAX_HISTORY_LIMIT]`,
/// defaulting to `DEFAULT_HISTORY_LIMIT`.
pub fn clamp_history_limit(limit: Option<u32>) -> u32 {
    match limit {
        Some(n) => n.clamp(1, MAX_HISTORY_LIMIT),
        None => DEFAULT_HISTORY_LIMIT,
    }
}

/// Lists the most recent messages of a chat in chronological (oldest-first)
/// order. The newest `limit` rows are selected, then reversed, so a short
/// page always contains the tail of the conversation.
pub fn list_messages(
    conn: &Connection,
    chat_id: &str,
    limit: Option<u32>,
) -> Result<Vec<Message>, StoreError> {
    let limit = clamp_history_limit(limit);

    let mut stmt = conn.prepare(
        "SELECT m.id, m.chat_id, m.sender_id, m.body, m.created_at, u.name, u.avatar_url
         FROM messages m JOIN users u ON u.id = m.sender_id
         WHERE m.chat_id = ?1
         ORDER BY m.created_at DESC, m.rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![chat_id, limit], map_row_to_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    messages.reverse();
    Ok(messages)
}

/// Deletes every message in a chat. Returns the number of rows removed.
pub fn purge_messages(conn: &Connection, chat_id: &str) -> Result<usize, StoreError> {
    let count = conn.execute("DELETE FROM messages WHERE chat_id = ?1", [chat_id])?;
    Ok(count)
}

/// Bumps a chat's `updated_at` so listings sort it to the top.
pub fn touch_chat(conn: &Connection, chat_id: &str) -> Result<(), StoreError> {
    let count = conn.execute(
        "UPDATE chats SET updated_at = datetime('now') WHERE id = ?1",
        [chat_id],
    )?;
    if count == 0 {
        return Err(StoreError::NotFound(chat_id.to_string()));
    }
    Ok(())
}

/// Removes a user's membership from a chat. When the last member leaves, the
/// chat itself is deleted and its messages cascade away.
///
/// Returns `true` when the chat was deleted.
pub fn leave_chat(conn: &Connection, chat_id: &str, user_id: &str) -> Result<bool, StoreError> {
    conn.execute(
        "DELETE FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
        [chat_id, user_id],
    )?;

    let remaining: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1",
        [chat_id],
        |row| row.get(0),
    )?;

    if remaining == 0 {
        conn.execute("DELETE FROM chats WHERE id = ?1", [chat_id])?;
        return Ok(true);
    }
    Ok(false)
}

fn latest_message(conn: &Connection, chat_id: &str) -> Result<Option<Message>, StoreError> {
    let message = conn
        .query_row(
            "SELECT m.id, m.chat_id, m.sender_id, m.body, m.created_at, u.name, u.avatar_url
             FROM messages m JOIN users u ON u.id = m.sender_id
             WHERE m.chat_id = ?1
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT 1",
            [chat_id],
            map_row_to_message,
        )
        .optional()?;
    Ok(message)
}
