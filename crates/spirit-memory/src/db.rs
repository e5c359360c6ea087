use rusqlite::{Connection, Result};

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_memory_blocks_table(conn)?;
    create_memory_events_table(conn)?;
    create_pending_mutations_table(conn)?;
    create_conversation_messages_table(conn)?;
    Ok(())
}

fn create_memory_blocks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_blocks (
            id          TEXT PRIMARY KEY,
            owner       TEXT NOT NULL,
            tier        TEXT NOT NULL,
            label       TEXT NOT NULL,
            content     TEXT NOT NULL,
            embedding   BLOB,
            permission  TEXT NOT NULL,
            pinned      INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(owner, label)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_blocks_owner_tier
            ON memory_blocks(owner, tier, created_at);",
    )
}

fn create_memory_events_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_events (
            id          TEXT PRIMARY KEY,
            block_id    TEXT NOT NULL,
            event_type  TEXT NOT NULL,
            old_content TEXT,
            new_content TEXT,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memory_events_block
            ON memory_events(block_id, created_at);",
    )
}

fn create_pending_mutations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pending_mutations (
            id               TEXT PRIMARY KEY,
            block_id         TEXT NOT NULL,
            proposed_content TEXT NOT NULL,
            reason           TEXT,
            status           TEXT NOT NULL,
            feedback         TEXT,
            created_at       TEXT NOT NULL,
            resolved_at      TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_pending_mutations_block
            ON pending_mutations(block_id, status);",
    )
}

fn create_conversation_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversation_messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            tool_calls      TEXT,
            tool_call_id    TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversation_messages_conv
            ON conversation_messages(conversation_id, created_at);",
    )
}
