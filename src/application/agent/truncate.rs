use crate::domain::types::{ChatMessage, MessageRole};

/// Rough token count for a message (~4 characters per token).
pub fn estimate_tokens(msg: &ChatMessage) -> i64 {
    let mut chars = msg.content.len();
    for call in &msg.tool_calls {
        chars += call.function.name.len() + call.function.arguments.len();
    }
    (chars / 4) as i64
}

/// Keeps a message list within a token budget.
///
/// Rules:
/// 1. a leading `system` message is always kept,
/// 2. recent messages win: blocks are scanned from the tail,
/// 3. an assistant message with tool calls plus its consecutive `tool`
///    replies form an atomic block and are never split,
/// 4. a budget <= 0 disables truncation.
pub fn truncate_messages(messages: &[ChatMessage], max_tokens: i64) -> Vec<ChatMessage> {
    if max_tokens <= 0 || messages.is_empty() {
        return messages.to_vec();
    }

    let mut budget = max_tokens;
    let mut start_idx = 0;
    if messages[0].role == MessageRole::System {
        budget -= estimate_tokens(&messages[0]);
        start_idx = 1;
        if budget <= 0 {
            return messages[..1].to_vec();
        }
    }

    struct Block {
        start: usize,
        tokens: i64,
    }

    let rest = &messages[start_idx..];
    let mut blocks: Vec<Block> = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        let msg = &rest[i];
        if msg.role == MessageRole::Assistant && msg.has_tool_calls() {
            let mut tokens = estimate_tokens(msg);
            let mut j = i + 1;
            while j < rest.len() && rest[j].role == MessageRole::Tool {
                tokens += estimate_tokens(&rest[j]);
                j += 1;
            }
            blocks.push(Block { start: i, tokens });
            i = j;
        } else {
            blocks.push(Block {
                start: i,
                tokens: estimate_tokens(msg),
            });
            i += 1;
        }
    }

    // Accumulate whole blocks from the tail until the budget is exhausted.
    let mut used = 0;
    let mut cut_block = 0;
    for k in (0..blocks.len()).rev() {
        if used + blocks[k].tokens > budget {
            cut_block = k + 1;
            break;
        }
        used += blocks[k].tokens;
    }

    if cut_block >= blocks.len() {
        // Nothing fits.
        return if start_idx > 0 {
            messages[..1].to_vec()
        } else {
            Vec::new()
        };
    }

    let cut_idx = start_idx + blocks[cut_block].start;
    let mut out = Vec::with_capacity(1 + messages.len() - cut_idx);
    if start_idx > 0 {
        out.push(messages[0].clone());
    }
    out.extend_from_slice(&messages[cut_idx..]);
    out
}
