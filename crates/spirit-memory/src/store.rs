//! Pure data access for memory blocks, their event log, pending mutations,
//! and the conversation message log. No permission policy lives here — see
//! `manager` for that.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{MemoryError, Result};
use crate::types::{
    ConversationMessage, EventType, MemoryBlock, MemoryEvent, MessageRole, MutationStatus,
    PendingMutation, Permission, Tier, ToolUse,
};

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -- blocks --------------------------------------------------------

    pub fn get_block(&self, id: &str) -> Result<Option<MemoryBlock>> {
        let db = self.conn.lock().unwrap();
        db.query_row(
            "SELECT id, owner, tier, label, content, embedding, permission, pinned,
                    created_at, updated_at
             FROM memory_blocks WHERE id = ?1",
            params![id],
            row_to_block,
        )
        .optional()
        .map_err(MemoryError::from)
    }

    pub fn get_block_by_label(&self, owner: &str, label: &str) -> Result<Option<MemoryBlock>> {
        let db = self.conn.lock().unwrap();
        db.query_row(
            "SELECT id, owner, tier, label, content, embedding, permission, pinned,
                    created_at, updated_at
             FROM memory_blocks WHERE owner = ?1 AND label = ?2",
            params![owner, label],
            row_to_block,
        )
        .optional()
        .map_err(MemoryError::from)
    }

    pub fn get_blocks_by_tier(&self, owner: &str, tier: Tier) -> Result<Vec<MemoryBlock>> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, owner, tier, label, content, embedding, permission, pinned,
                    created_at, updated_at
             FROM memory_blocks WHERE owner = ?1 AND tier = ?2
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![owner, tier.to_string()], row_to_block)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Persists `block`, generating an id if absent. No event side effect —
    /// callers that want an audit trail log it themselves.
    pub fn create_block(&self, mut block: MemoryBlock) -> Result<MemoryBlock> {
        if block.id.is_empty() {
            block.id = Uuid::new_v4().to_string();
        }
        let db = self.conn.lock().unwrap();
        db.execute(
            "INSERT INTO memory_blocks
             (id, owner, tier, label, content, embedding, permission, pinned,
              created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                block.id,
                block.owner,
                block.tier.to_string(),
                block.label,
                block.content,
                encode_embedding(block.embedding.as_deref()),
                block.permission.to_string(),
                block.pinned as i64,
                block.created_at,
                block.updated_at,
            ],
        )?;
        Ok(block)
    }

    pub fn update_block(
        &self,
        id: &str,
        content: &str,
        embedding: Option<&[f32]>,
    ) -> Result<MemoryBlock> {
        let now = Utc::now().to_rfc3339();
        let db = self.conn.lock().unwrap();
        let n = db.execute(
            "UPDATE memory_blocks SET content = ?1, embedding = ?2, updated_at = ?3
             WHERE id = ?4",
            params![content, encode_embedding(embedding), now, id],
        )?;
        if n == 0 {
            return Err(MemoryError::BlockNotFound(id.to_string()));
        }
        drop(db);
        self.get_block(id)?
            .ok_or_else(|| MemoryError::BlockNotFound(id.to_string()))
    }

    pub fn delete_block(&self, id: &str) -> Result<()> {
        let db = self.conn.lock().unwrap();
        db.execute("DELETE FROM memory_blocks WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Cosine similarity search over blocks with an embedding, descending.
    /// Blocks without an embedding are excluded. Ties are not ordered
    /// deterministically beyond `ORDER BY similarity DESC`.
    pub fn search_by_embedding(
        &self,
        owner: &str,
        vector: &[f32],
        limit: usize,
        tier: Option<Tier>,
    ) -> Result<Vec<(MemoryBlock, f32)>> {
        let db = self.conn.lock().unwrap();
        let (sql, tier_str);
        let blocks: Vec<MemoryBlock> = if let Some(t) = tier {
            tier_str = t.to_string();
            sql = "SELECT id, owner, tier, label, content, embedding, permission, pinned,
                          created_at, updated_at
                   FROM memory_blocks
                   WHERE owner = ?1 AND tier = ?2 AND embedding IS NOT NULL";
            let mut stmt = db.prepare(sql)?;
            let rows = stmt.query_map(params![owner, tier_str], row_to_block)?;
            rows.filter_map(|r| r.ok()).collect()
        } else {
            sql = "SELECT id, owner, tier, label, content, embedding, permission, pinned,
                          created_at, updated_at
                   FROM memory_blocks
                   WHERE owner = ?1 AND embedding IS NOT NULL";
            let mut stmt = db.prepare(sql)?;
            let rows = stmt.query_map(params![owner], row_to_block)?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let mut scored: Vec<(MemoryBlock, f32)> = blocks
            .into_iter()
            .filter_map(|b| {
                let emb = b.embedding.as_deref()?;
                let sim = cosine_similarity(vector, emb);
                Some((b, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    // -- event log -------------------------------------------------------

    pub fn log_event(
        &self,
        block_id: &str,
        event_type: EventType,
        old_content: Option<&str>,
        new_content: Option<&str>,
    ) -> Result<MemoryEvent> {
        let event = MemoryEvent {
            id: Uuid::new_v4().to_string(),
            block_id: block_id.to_string(),
            event_type,
            old_content: old_content.map(String::from),
            new_content: new_content.map(String::from),
            created_at: Utc::now().to_rfc3339(),
        };
        let db = self.conn.lock().unwrap();
        db.execute(
            "INSERT INTO memory_events (id, block_id, event_type, old_content, new_content, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                event.id,
                event.block_id,
                event.event_type.to_string(),
                event.old_content,
                event.new_content,
                event.created_at,
            ],
        )?;
        Ok(event)
    }

    pub fn get_events(&self, block_id: &str) -> Result<Vec<MemoryEvent>> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, block_id, event_type, old_content, new_content, created_at
             FROM memory_events WHERE block_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![block_id], |row| {
            let event_type: String = row.get(2)?;
            Ok(MemoryEvent {
                id: row.get(0)?,
                block_id: row.get(1)?,
                event_type: event_type.parse().unwrap_or(EventType::Update),
                old_content: row.get(3)?,
                new_content: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // -- pending mutations -----------------------------------------------

    pub fn create_mutation(
        &self,
        block_id: &str,
        proposed_content: &str,
        reason: Option<&str>,
    ) -> Result<PendingMutation> {
        let mutation = PendingMutation {
            id: Uuid::new_v4().to_string(),
            block_id: block_id.to_string(),
            proposed_content: proposed_content.to_string(),
            reason: reason.map(String::from),
            status: MutationStatus::Pending,
            feedback: None,
            created_at: Utc::now().to_rfc3339(),
            resolved_at: None,
        };
        let db = self.conn.lock().unwrap();
        db.execute(
            "INSERT INTO pending_mutations
             (id, block_id, proposed_content, reason, status, feedback, created_at, resolved_at)
             VALUES (?1,?2,?3,?4,?5,NULL,?6,NULL)",
            params![
                mutation.id,
                mutation.block_id,
                mutation.proposed_content,
                mutation.reason,
                mutation.status.to_string(),
                mutation.created_at,
            ],
        )?;
        Ok(mutation)
    }

    pub fn get_mutation(&self, id: &str) -> Result<Option<PendingMutation>> {
        let db = self.conn.lock().unwrap();
        db.query_row(
            "SELECT id, block_id, proposed_content, reason, status, feedback,
                    created_at, resolved_at
             FROM pending_mutations WHERE id = ?1",
            params![id],
            row_to_mutation,
        )
        .optional()
        .map_err(MemoryError::from)
    }

    /// Pending mutations, optionally restricted to blocks owned by `owner`.
    pub fn get_pending_mutations(&self, owner: Option<&str>) -> Result<Vec<PendingMutation>> {
        let db = self.conn.lock().unwrap();
        let rows: Vec<PendingMutation> = if let Some(owner) = owner {
            let mut stmt = db.prepare(
                "SELECT m.id, m.block_id, m.proposed_content, m.reason, m.status, m.feedback,
                        m.created_at, m.resolved_at
                 FROM pending_mutations m
                 JOIN memory_blocks b ON b.id = m.block_id
                 WHERE m.status = 'pending' AND b.owner = ?1
                 ORDER BY m.created_at ASC",
            )?;
            stmt.query_map(params![owner], row_to_mutation)?
                .filter_map(|r| r.ok())
                .collect()
        } else {
            let mut stmt = db.prepare(
                "SELECT id, block_id, proposed_content, reason, status, feedback,
                        created_at, resolved_at
                 FROM pending_mutations WHERE status = 'pending' ORDER BY created_at ASC",
            )?;
            stmt.query_map([], row_to_mutation)?
                .filter_map(|r| r.ok())
                .collect()
        };
        Ok(rows)
    }

    pub fn resolve_mutation(
        &self,
        id: &str,
        status: MutationStatus,
        feedback: Option<&str>,
    ) -> Result<PendingMutation> {
        let now = Utc::now().to_rfc3339();
        let db = self.conn.lock().unwrap();
        let n = db.execute(
            "UPDATE pending_mutations SET status = ?1, feedback = ?2, resolved_at = ?3
             WHERE id = ?4",
            params![status.to_string(), feedback, now, id],
        )?;
        if n == 0 {
            return Err(MemoryError::MutationNotFound(id.to_string()));
        }
        drop(db);
        self.get_mutation(id)?
            .ok_or_else(|| MemoryError::MutationNotFound(id.to_string()))
    }

    // -- conversation messages -------------------------------------------

    pub fn insert_message(&self, mut msg: ConversationMessage) -> Result<ConversationMessage> {
        if msg.id.is_empty() {
            msg.id = Uuid::new_v4().to_string();
        }
        let tool_calls_json = match &msg.tool_calls {
            Some(calls) => Some(
                serde_json::to_string(calls)
                    .map_err(|e| MemoryError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let db = self.conn.lock().unwrap();
        db.execute(
            "INSERT INTO conversation_messages
             (id, conversation_id, role, content, tool_calls, tool_call_id, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                msg.id,
                msg.conversation_id,
                msg.role.to_string(),
                msg.content,
                tool_calls_json,
                msg.tool_call_id,
                msg.created_at,
            ],
        )?;
        Ok(msg)
    }

    /// Messages for `conversation_id`, strictly ascending by `created_at`.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, tool_calls, tool_call_id, created_at
             FROM conversation_messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_messages(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let db = self.conn.lock().unwrap();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM conversation_messages WHERE id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let n = db.execute(&sql, params.as_slice())?;
        Ok(n)
    }
}

fn encode_embedding(embedding: Option<&[f32]>) -> Option<String> {
    embedding.map(|v| serde_json::to_string(v).expect("f32 vec serializes"))
}

fn decode_embedding(raw: Option<String>) -> Option<Vec<f32>> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryBlock> {
    let tier: String = row.get(2)?;
    let permission: String = row.get(6)?;
    let embedding_raw: Option<String> = row.get(5)?;
    Ok(MemoryBlock {
        id: row.get(0)?,
        owner: row.get(1)?,
        tier: tier.parse().unwrap_or(Tier::Working),
        label: row.get(3)?,
        content: row.get(4)?,
        embedding: decode_embedding(embedding_raw),
        permission: permission.parse().unwrap_or(Permission::Readwrite),
        pinned: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_mutation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingMutation> {
    let status: String = row.get(4)?;
    Ok(PendingMutation {
        id: row.get(0)?,
        block_id: row.get(1)?,
        proposed_content: row.get(2)?,
        reason: row.get(3)?,
        status: status.parse().unwrap_or(MutationStatus::Pending),
        feedback: row.get(5)?,
        created_at: row.get(6)?,
        resolved_at: row.get(7)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationMessage> {
    let role: String = row.get(2)?;
    let tool_calls_json: Option<String> = row.get(4)?;
    let tool_calls: Option<Vec<ToolUse>> = tool_calls_json.and_then(|s| serde_json::from_str(&s).ok());
    Ok(ConversationMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: role.parse().unwrap_or(MessageRole::User),
        content: row.get(3)?,
        tool_calls,
        tool_call_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}
