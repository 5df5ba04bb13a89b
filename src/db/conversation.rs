//! Conversation and message repository

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{parse_datetime, DbPool};
use crate::{Error, Result};

/// Direction of a stored message relative to the business
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        if s == "outbound" {
            Self::Outbound
        } else {
            Self::Inbound
        }
    }
}

/// A conversation thread between a business instance and one contact
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub contact_phone: String,
    pub contact_name: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub last_direction: Direction,
}

/// A single message inside a conversation
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub body: String,
    pub sent_by_ai: bool,
    pub created_at: DateTime<Utc>,
}

/// Conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a message, creating the conversation row if this is the first
    /// exchange with the contact. Returns the conversation id.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record_message(
        &self,
        tenant_id: &str,
        instance_id: &str,
        contact_phone: &str,
        contact_name: Option<&str>,
        direction: Direction,
        body: &str,
        sent_by_ai: bool,
    ) -> Result<String> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let conv_id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO conversations (id, tenant_id, instance_id, contact_phone, contact_name, last_message_at, last_direction, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6)
             ON CONFLICT(tenant_id, instance_id, contact_phone) DO UPDATE SET
                contact_name = COALESCE(excluded.contact_name, conversations.contact_name),
                last_message_at = excluded.last_message_at,
                last_direction = excluded.last_direction",
            rusqlite::params![
                conv_id,
                tenant_id,
                instance_id,
                contact_phone,
                contact_name,
                now,
                direction.as_str()
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        let conversation_id: String = conn
            .query_row(
                "SELECT id FROM conversations WHERE tenant_id = ?1 AND instance_id = ?2 AND contact_phone = ?3",
                [tenant_id, instance_id, contact_phone],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO messages (id, conversation_id, direction, content, sent_by_ai, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                conversation_id,
                direction.as_str(),
                body,
                sent_by_ai,
                now
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(conversation_id)
    }

    /// Conversations whose last message is older than `min_silence_hours`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn stale_conversations(
        &self,
        tenant_id: &str,
        instance_id: &str,
        min_silence_hours: i64,
    ) -> Result<Vec<Conversation>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let cutoff = (Utc::now() - chrono::Duration::hours(min_silence_hours)).to_rfc3339();

        let mut stmt = conn
            .prepare(
                "SELECT id, tenant_id, instance_id, contact_phone, contact_name, last_message_at, last_direction
                 FROM conversations
                 WHERE tenant_id = ?1 AND instance_id = ?2 AND last_message_at < ?3
                 ORDER BY last_message_at ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let rows = stmt
            .query_map([tenant_id, instance_id, cutoff.as_str()], row_to_conversation)
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(rows)
    }

    /// Most recent messages for a conversation, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent_messages(&self, conversation_id: &str, limit: u32) -> Result<Vec<StoredMessage>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, direction, content, sent_by_ai, created_at FROM (
                    SELECT id, conversation_id, direction, content, sent_by_ai, created_at
                    FROM messages WHERE conversation_id = ?1
                    ORDER BY created_at DESC LIMIT ?2
                 ) ORDER BY created_at ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![conversation_id, limit], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    direction: Direction::from_str(&row.get::<_, String>(2)?),
                    body: row.get(3)?,
                    sent_by_ai: row.get(4)?,
                    created_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(rows)
    }

    /// Total messages stored for a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn message_count(&self, conversation_id: &str) -> Result<u32> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        instance_id: row.get(2)?,
        contact_phone: row.get(3)?,
        contact_name: row.get(4)?,
        last_message_at: parse_datetime(&row.get::<_, String>(5)?),
        last_direction: Direction::from_str(&row.get::<_, String>(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn record_message_dedupes_conversation() {
        let repo = ConversationRepo::new(init_memory().unwrap());

        let a = repo
            .record_message("org-1", "inst-1", "5511988887777", Some("Ana"), Direction::Inbound, "oi", false)
            .unwrap();
        let b = repo
            .record_message("org-1", "inst-1", "5511988887777", None, Direction::Outbound, "olá!", false)
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(repo.message_count(&a).unwrap(), 2);

        let msgs = repo.recent_messages(&a, 10).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].direction, Direction::Inbound);
        assert_eq!(msgs[1].direction, Direction::Outbound);
    }

    #[test]
    fn stale_conversations_respects_cutoff() {
        let repo = ConversationRepo::new(init_memory().unwrap());
        repo.record_message("org-1", "inst-1", "5511988887777", None, Direction::Outbound, "oi", false)
            .unwrap();

        // just written, so nothing is older than one hour
        assert!(repo.stale_conversations("org-1", "inst-1", 1).unwrap().is_empty());
        // zero-hour cutoff is in the future relative to the write
        assert_eq!(repo.stale_conversations("org-1", "inst-1", -1).unwrap().len(), 1);
    }
}
