//! Recursive fold-summarization compactor. See spec §4.3.
//!
//! Chunks the oldest part of a conversation's history, folds each chunk into
//! a running summary, archives the result as labeled archival-tier memory
//! blocks, and — once the number of archived batches for a conversation
//! grows past a threshold — recursively re-summarizes the oldest ones so the
//! archive itself stays bounded. The live history handed back to the agent
//! loop is a short "clip archive" header plus the untouched recent tail.

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use spirit_core::config::CompactorConfig;
use spirit_memory::types::{ConversationMessage, MessageRole, SummaryBatch, Tier};
use spirit_memory::{MemoryManager, MemoryStore};
use tracing::warn;

use crate::provider::{ChatRequest, Message, Role};
use crate::runtime::AgentRuntime;

const PRIOR_SUMMARY_PREFIX: &str = "[Context Summary —";

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub history: Vec<ConversationMessage>,
    pub batches_created: usize,
    pub messages_compressed: usize,
    pub tokens_estimate_before: usize,
    pub tokens_estimate_after: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum CompactorError {
    #[error("model error: {0}")]
    Model(#[from] crate::provider::ProviderError),
    #[error("memory error: {0}")]
    Memory(#[from] spirit_memory::MemoryError),
}

pub struct Compactor {
    store: Arc<MemoryStore>,
    memory: Arc<MemoryManager>,
    runtime: Arc<AgentRuntime>,
    config: CompactorConfig,
}

impl Compactor {
    pub fn new(
        store: Arc<MemoryStore>,
        memory: Arc<MemoryManager>,
        runtime: Arc<AgentRuntime>,
        config: CompactorConfig,
    ) -> Self {
        Self {
            store,
            memory,
            runtime,
            config,
        }
    }

    /// Compresses `history`. Never fails outwardly: a failure at any step
    /// (model, storage) is logged and the original history is returned
    /// unchanged, so a broken compaction never corrupts a conversation.
    pub async fn compress(
        &self,
        owner: &str,
        conversation_id: &str,
        history: Vec<ConversationMessage>,
    ) -> CompactionResult {
        match self.try_compress(owner, conversation_id, &history).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "compaction failed; conversation history left unchanged");
                let tokens = estimate_tokens(&history);
                CompactionResult {
                    history,
                    batches_created: 0,
                    messages_compressed: 0,
                    tokens_estimate_before: tokens,
                    tokens_estimate_after: tokens,
                }
            }
        }
    }

    async fn try_compress(
        &self,
        owner: &str,
        conversation_id: &str,
        history: &[ConversationMessage],
    ) -> Result<CompactionResult, CompactorError> {
        let tokens_before = estimate_tokens(history);

        let (prior_summary, rest) = split_prior_summary(history);
        let keep_n = self.config.keep_recent.min(rest.len());
        let split_at = rest.len() - keep_n;
        let to_compress = &rest[..split_at];
        let to_keep = &rest[split_at..];

        if to_compress.is_empty() {
            return Ok(CompactionResult {
                history: history.to_vec(),
                batches_created: 0,
                messages_compressed: 0,
                tokens_estimate_before: tokens_before,
                tokens_estimate_after: tokens_before,
            });
        }

        let model = self.runtime.get_model().await;
        let mut accumulated = prior_summary.map(|m| m.content.clone()).unwrap_or_default();
        let mut batches_created = 0usize;

        for chunk in to_compress.chunks(self.config.chunk_size.max(1)) {
            let request = self.build_fold_request(&model, &accumulated, chunk);
            let response = self.runtime.send(&request).await?;
            accumulated = response.text();

            let batch = SummaryBatch {
                content: accumulated.clone(),
                depth: 0,
                start_time: chunk.first().expect("chunk is non-empty").created_at.clone(),
                end_time: chunk.last().expect("chunk is non-empty").created_at.clone(),
                message_count: chunk.len(),
            };
            self.archive_batch(owner, conversation_id, &batch).await?;
            batches_created += 1;
        }

        self.maybe_resummarize(owner, conversation_id).await?;

        let ids: Vec<String> = to_compress.iter().map(|m| m.id.clone()).collect();
        self.store.delete_messages(&ids)?;

        let clip_text = self.build_clip_archive(owner, conversation_id)?;
        let clip_message = self.store.insert_message(ConversationMessage {
            id: String::new(),
            conversation_id: conversation_id.to_string(),
            role: MessageRole::System,
            content: clip_text,
            tool_calls: None,
            tool_call_id: None,
            created_at: Utc::now().to_rfc3339(),
        })?;

        let mut new_history = Vec::with_capacity(1 + to_keep.len());
        new_history.push(clip_message);
        new_history.extend(to_keep.iter().cloned());

        let tokens_after = estimate_tokens(&new_history);

        Ok(CompactionResult {
            history: new_history,
            batches_created,
            messages_compressed: to_compress.len(),
            tokens_estimate_before: tokens_before,
            tokens_estimate_after: tokens_after,
        })
    }

    fn build_fold_request(&self, model: &str, accumulated: &str, chunk: &[ConversationMessage]) -> ChatRequest {
        let system = self
            .config
            .prompt
            .clone()
            .unwrap_or_else(default_fold_prompt);
        let mut messages = Vec::with_capacity(2);
        if !accumulated.is_empty() {
            messages.push(Message::text(
                Role::User,
                format!("Previous summary:\n{accumulated}"),
            ));
        }
        messages.push(Message::text(
            Role::User,
            format!("Messages to fold into the summary:\n{}", render_transcript(chunk)),
        ));
        ChatRequest {
            model: model.to_string(),
            system,
            messages,
            max_tokens: self.config.max_summary_tokens,
            tools: Vec::new(),
        }
    }

    fn build_resummarize_request(&self, model: &str, combined: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            system: default_resummarize_prompt(),
            messages: vec![Message::text(Role::User, combined.to_string())],
            max_tokens: self.config.max_summary_tokens,
            tools: Vec::new(),
        }
    }

    async fn archive_batch(
        &self,
        owner: &str,
        conversation_id: &str,
        batch: &SummaryBatch,
    ) -> Result<(), CompactorError> {
        let label = batch_label(conversation_id, &batch.end_time);
        let payload = format!(
            "[depth:{}|start:{}|end:{}|count:{}]\n{}",
            batch.depth, batch.start_time, batch.end_time, batch.message_count, batch.content
        );
        self.memory
            .write(owner, &label, &payload, Some(Tier::Archival), None)
            .await?;
        Ok(())
    }

    fn list_batches(
        &self,
        owner: &str,
        conversation_id: &str,
    ) -> Result<Vec<(spirit_memory::types::MemoryBlock, BatchMeta)>, CompactorError> {
        let blocks = self.store.get_blocks_by_tier(owner, Tier::Archival)?;
        let prefix = format!("compaction-batch-{conversation_id}-");
        let mut batches: Vec<_> = blocks
            .into_iter()
            .filter(|b| b.label.starts_with(&prefix))
            .map(|b| {
                let meta = parse_batch_header(&b.content);
                (b, meta)
            })
            .collect();
        batches.sort_by(|a, b| a.1.start.cmp(&b.1.start));
        Ok(batches)
    }

    async fn maybe_resummarize(&self, owner: &str, conversation_id: &str) -> Result<(), CompactorError> {
        let batches = self.list_batches(owner, conversation_id)?;
        let threshold = self.config.clip_first + self.config.clip_last + 2;
        if batches.len() <= threshold {
            return Ok(());
        }

        let clip_last = self.config.clip_last.min(batches.len());
        let split_at = batches.len() - clip_last;
        let to_resummarize = &batches[..split_at];
        if to_resummarize.is_empty() {
            return Ok(());
        }

        let max_depth = to_resummarize.iter().map(|(_, m)| m.depth).max().unwrap_or(0);
        let combined = to_resummarize
            .iter()
            .map(|(_, m)| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let new_start = to_resummarize.first().unwrap().1.start.clone();
        let new_end = to_resummarize.last().unwrap().1.end.clone();
        let new_count: usize = to_resummarize.iter().map(|(_, m)| m.count).sum();

        let model = self.runtime.get_model().await;
        let request = self.build_resummarize_request(&model, &combined);
        let response = self.runtime.send(&request).await?;

        // Delete the source batches before archiving the consolidated one:
        // the new batch's label keys off `new_end`, which equals the last
        // source batch's endTime and would otherwise collide.
        for (block, _) in to_resummarize {
            self.memory.delete_block(&block.id)?;
        }

        let new_batch = SummaryBatch {
            content: response.text(),
            depth: max_depth + 1,
            start_time: new_start,
            end_time: new_end,
            message_count: new_count,
        };
        self.archive_batch(owner, conversation_id, &new_batch).await?;
        Ok(())
    }

    fn build_clip_archive(&self, owner: &str, conversation_id: &str) -> Result<String, CompactorError> {
        let batches = self.list_batches(owner, conversation_id)?;
        let total_messages: usize = batches.iter().map(|(_, m)| m.count).sum();
        let cycles = batches.iter().map(|(_, m)| m.depth).max().unwrap_or(0) + 1;

        let mut out = format!(
            "{PRIOR_SUMMARY_PREFIX} {total_messages} messages compressed across {cycles} compaction cycle(s)]\n"
        );

        let clip_first = self.config.clip_first;
        let clip_last = self.config.clip_last;
        let total = batches.len();

        if total <= clip_first + clip_last {
            for (i, (_, meta)) in batches.iter().enumerate() {
                append_batch(&mut out, i + 1, meta);
            }
        } else {
            out.push_str("\n## Earliest context\n");
            for (i, (_, meta)) in batches.iter().take(clip_first).enumerate() {
                append_batch(&mut out, i + 1, meta);
            }
            let omitted = total - clip_first - clip_last;
            out.push_str(&format!(
                "[... {omitted} earlier summaries omitted, searchable via memory_read ...]\n"
            ));
            out.push_str("\n## Recent context\n");
            let recent_start = total - clip_last;
            for (i, (_, meta)) in batches.iter().skip(recent_start).enumerate() {
                append_batch(&mut out, recent_start + i + 1, meta);
            }
        }
        Ok(out)
    }
}

fn append_batch(out: &mut String, index: usize, meta: &BatchMeta) {
    out.push_str(&format!(
        "[Batch {index} — depth {}, {} to {}]\n{}\n",
        meta.depth, meta.start, meta.end, meta.text
    ));
}

fn batch_label(conversation_id: &str, end_time: &str) -> String {
    format!("compaction-batch-{conversation_id}-{end_time}")
}

struct BatchMeta {
    depth: u32,
    start: String,
    end: String,
    count: usize,
    text: String,
}

/// Parses a batch's stored `[depth:N|start:S|end:E|count:C]\n<text>` header.
/// Malformed content (shouldn't happen outside of manual tampering) degrades
/// to depth 0, now/now, count 0, with the whole content treated as text.
fn parse_batch_header(content: &str) -> BatchMeta {
    let re = Regex::new(r"(?s)^\[depth:(\d+)\|start:([^|]+)\|end:([^|]+)\|count:(\d+)\]\n(.*)$")
        .expect("static pattern compiles");
    if let Some(caps) = re.captures(content) {
        BatchMeta {
            depth: caps[1].parse().unwrap_or(0),
            start: caps[2].to_string(),
            end: caps[3].to_string(),
            count: caps[4].parse().unwrap_or(0),
            text: caps[5].to_string(),
        }
    } else {
        let now = Utc::now().to_rfc3339();
        BatchMeta {
            depth: 0,
            start: now.clone(),
            end: now,
            count: 0,
            text: content.to_string(),
        }
    }
}

fn split_prior_summary(history: &[ConversationMessage]) -> (Option<&ConversationMessage>, &[ConversationMessage]) {
    if let Some(first) = history.first() {
        if first.role == MessageRole::System && first.content.starts_with(PRIOR_SUMMARY_PREFIX) {
            return (Some(first), &history[1..]);
        }
    }
    (None, history)
}

fn render_transcript(chunk: &[ConversationMessage]) -> String {
    chunk
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `ceil(len(content) / 4)` summed over every message — the same cheap
/// token estimate the agent loop uses for its pre-round compression trigger.
pub fn estimate_tokens(history: &[ConversationMessage]) -> usize {
    history.iter().map(|m| (m.content.len() + 3) / 4).sum()
}

fn default_fold_prompt() -> String {
    "Summarize the following conversation messages, extending the previous \
summary if one is given. Preserve concrete facts, decisions, and \
commitments; drop small talk and restated context."
        .to_string()
}

fn default_resummarize_prompt() -> String {
    "The following are several archived conversation summaries, oldest \
first. Produce a single consolidated summary that preserves the most \
important facts, decisions, and commitments while being noticeably more \
concise than their concatenation."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, ContentBlock, LlmProvider, ProviderError, StopReason};
    use async_trait::async_trait;
    use rusqlite::Connection;
    use spirit_memory::embedding::EmbeddingProvider;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![text.len() as f32])
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }
    }

    struct StubProvider;

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let summary = format!("summary of {} message(s)", req.messages.len());
            Ok(ChatResponse {
                content: vec![ContentBlock::Text { text: summary }],
                model: req.model.clone(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: StopReason::EndTurn,
            })
        }
    }

    fn compactor(config: CompactorConfig) -> Compactor {
        let store = Arc::new(MemoryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let memory = Arc::new(MemoryManager::new(store.clone(), Arc::new(StubEmbedder)));
        let runtime = Arc::new(AgentRuntime::new(Box::new(StubProvider), "stub-model".to_string()));
        Compactor::new(store, memory, runtime, config)
    }

    fn message(id: &str, content: &str, created_at: &str) -> ConversationMessage {
        ConversationMessage {
            id: id.to_string(),
            conversation_id: "convo".to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            tool_calls: None,
            tool_call_id: None,
            created_at: created_at.to_string(),
        }
    }

    fn history(n: usize) -> Vec<ConversationMessage> {
        (0..n)
            .map(|i| message(&format!("m{i}"), &format!("message {i}"), &format!("2026-01-01T00:00:{i:02}Z")))
            .collect()
    }

    #[tokio::test]
    async fn short_history_is_left_untouched() {
        let c = compactor(CompactorConfig {
            chunk_size: 20,
            keep_recent: 5,
            max_summary_tokens: 256,
            clip_first: 2,
            clip_last: 2,
            prompt: None,
        });
        let h = history(3);
        let result = c.compress("alice", "convo", h.clone()).await;
        assert_eq!(result.messages_compressed, 0);
        assert_eq!(result.history.len(), h.len());
    }

    #[tokio::test]
    async fn compresses_oldest_messages_and_keeps_the_recent_tail() {
        let c = compactor(CompactorConfig {
            chunk_size: 5,
            keep_recent: 3,
            max_summary_tokens: 256,
            clip_first: 2,
            clip_last: 2,
            prompt: None,
        });
        let h = history(10);
        let result = c.compress("alice", "convo", h).await;
        assert_eq!(result.messages_compressed, 7);
        assert_eq!(result.batches_created, 2);
        // clip-archive header + 3 kept messages
        assert_eq!(result.history.len(), 4);
        assert!(result.history[0].content.starts_with(PRIOR_SUMMARY_PREFIX));
        assert_eq!(result.history[1].content, "message 7");
    }

    #[test]
    fn parse_batch_header_round_trips() {
        let content = "[depth:1|start:2026-01-01T00:00:00Z|end:2026-01-01T00:05:00Z|count:20]\nthe summary text";
        let meta = parse_batch_header(content);
        assert_eq!(meta.depth, 1);
        assert_eq!(meta.count, 20);
        assert_eq!(meta.text, "the summary text");
    }

    #[test]
    fn parse_batch_header_degrades_gracefully_on_malformed_content() {
        let meta = parse_batch_header("not a batch header");
        assert_eq!(meta.depth, 0);
        assert_eq!(meta.count, 0);
        assert_eq!(meta.text, "not a batch header");
    }
}
