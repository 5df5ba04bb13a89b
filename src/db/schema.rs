//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Tenant chat-protocol instances (one row per connection slot)
        CREATE TABLE IF NOT EXISTS instances (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'disconnected'
                CHECK(status IN ('disconnected', 'connecting', 'pairing', 'connected', 'error')),
            phone_number TEXT,
            last_error TEXT,
            last_connected_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_instances_tenant ON instances(tenant_id);

        -- Phone numbers authorized to speak as the business owner
        CREATE TABLE IF NOT EXISTS owner_numbers (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            phone_number TEXT NOT NULL,
            owner_name TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(tenant_id, phone_number)
        );

        -- Conversations per (tenant, instance, contact)
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            contact_phone TEXT NOT NULL,
            contact_name TEXT,
            last_message_at TEXT,
            last_direction TEXT NOT NULL DEFAULT 'inbound'
                CHECK(last_direction IN ('inbound', 'outbound')),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(tenant_id, instance_id, contact_phone)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_instance
            ON conversations(tenant_id, instance_id);

        -- Conversation turns
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            direction TEXT NOT NULL CHECK(direction IN ('inbound', 'outbound')),
            content TEXT NOT NULL,
            sent_by_ai INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        -- Forgotten customers surfaced by the recovery scan
        CREATE TABLE IF NOT EXISTS forgotten_customers (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            contact_phone TEXT NOT NULL,
            contact_name TEXT,
            silent_side TEXT NOT NULL CHECK(silent_side IN ('business', 'customer')),
            last_message TEXT NOT NULL,
            last_message_at TEXT NOT NULL,
            hours_of_silence INTEGER NOT NULL,
            temperature INTEGER NOT NULL,
            temperature_label TEXT NOT NULL,
            temperature_emoji TEXT NOT NULL,
            temperature_explanation TEXT NOT NULL,
            estimated_value_cents INTEGER NOT NULL,
            suggested_reply TEXT NOT NULL DEFAULT '',
            reply_rationale TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'found'
                CHECK(status IN ('found', 'replied', 'converted', 'ignored')),
            replied_at TEXT,
            converted_at TEXT,
            converted_value_cents INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(tenant_id, contact_phone)
        );

        CREATE INDEX IF NOT EXISTS idx_forgotten_instance
            ON forgotten_customers(tenant_id, instance_id);

        PRAGMA user_version = 1;
        ",
    )?;
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Broker job storage, one namespace per queue
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'ready'
                CHECK(status IN ('ready', 'active', 'completed', 'failed', 'dead')),
            progress INTEGER NOT NULL DEFAULT 0,
            result TEXT,
            run_at TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            claimed_at TEXT,
            finished_at TEXT,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, status, run_at);

        -- Jobs that exhausted retries; retained indefinitely for triage
        CREATE TABLE IF NOT EXISTS dead_letters (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            job_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            error TEXT NOT NULL,
            failed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dead_letters_queue ON dead_letters(queue);

        PRAGMA user_version = 2;
        ",
    )?;
    Ok(())
}
