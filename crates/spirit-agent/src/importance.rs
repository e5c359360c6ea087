//! Pure message-importance scoring, exposed separately from the compactor's
//! default fold-summarization path for callers that want to drive chunk
//! selection a different way. See spec §4.3 "Importance scoring".

use spirit_memory::types::{ConversationMessage, MessageRole};

#[derive(Debug, Clone)]
pub struct ImportanceConfig {
    pub decay: f64,
    pub user_weight: f64,
    pub assistant_weight: f64,
    pub tool_weight: f64,
    pub system_weight: f64,
    pub question_bonus: f64,
    pub tool_call_bonus: f64,
    pub keyword_bonuses: Vec<(String, f64)>,
    pub content_length_weight: f64,
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        Self {
            decay: 0.95,
            user_weight: 1.0,
            assistant_weight: 0.8,
            tool_weight: 0.5,
            system_weight: 0.6,
            question_bonus: 0.5,
            tool_call_bonus: 0.3,
            keyword_bonuses: Vec::new(),
            content_length_weight: 1.0,
        }
    }
}

/// Scores `message`, the `index`-th of `total` messages in its window, under
/// `cfg`. Higher is more important. Recency decays geometrically from the
/// newest message backward; questions, tool calls, configured keywords, and
/// message length each add a bounded bonus on top.
pub fn score(message: &ConversationMessage, index: usize, total: usize, cfg: &ImportanceConfig) -> f64 {
    let role_weight = match message.role {
        MessageRole::User => cfg.user_weight,
        MessageRole::Assistant => cfg.assistant_weight,
        MessageRole::Tool => cfg.tool_weight,
        MessageRole::System => cfg.system_weight,
    };
    let age = total.saturating_sub(1).saturating_sub(index);
    let recency_term = role_weight * cfg.decay.powi(age as i32);

    let question_bonus = if message.content.contains('?') {
        cfg.question_bonus
    } else {
        0.0
    };

    let tool_call_bonus = if message
        .tool_calls
        .as_ref()
        .is_some_and(|calls| !calls.is_empty())
    {
        cfg.tool_call_bonus
    } else {
        0.0
    };

    let lower = message.content.to_lowercase();
    let keyword_bonus: f64 = cfg
        .keyword_bonuses
        .iter()
        .filter(|(kw, _)| lower.contains(kw.to_lowercase().as_str()))
        .map(|(_, bonus)| bonus)
        .sum();

    let length_bonus = (message.content.len() as f64 / 100.0 * cfg.content_length_weight).min(3.0);

    recency_term + question_bonus + tool_call_bonus + keyword_bonus + length_bonus
}
