//! Incremental reconstruction of one assistant message from indexed
//! `content_block_start` / `content_block_delta` / `content_block_stop`
//! events.

use corral_core::content::ContentBlock;
use corral_core::messages::{BlockDelta, WireBlock};
use serde_json::Value;

/// Highest block index a message may use; starts beyond it are dropped.
pub const MAX_BLOCKS: usize = 1024;

#[derive(Clone, Debug)]
enum BlockState {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        /// Input announced at block start; used when no partial JSON arrives.
        seed: Value,
        partial_json: String,
    },
}

#[derive(Clone, Debug)]
struct Slot {
    state: BlockState,
    complete: bool,
}

/// Index-addressed in-progress blocks for the current assistant turn.
#[derive(Debug, Default)]
pub struct ContentAssembler {
    slots: Vec<Option<Slot>>,
    message_id: Option<String>,
}

impl ContentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all slots and start a new message.
    pub fn reset(&mut self, message_id: Option<String>) {
        self.slots.clear();
        self.message_id = message_id;
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Allocate (or overwrite) the slot at `index`. Unknown block kinds leave
    /// the slot empty.
    pub fn start_block(&mut self, index: usize, block: &WireBlock) {
        if index >= MAX_BLOCKS {
            tracing::warn!(index, max = MAX_BLOCKS, "block index out of range, dropping block");
            return;
        }
        let state = match block {
            WireBlock::Text { text } => BlockState::Text { text: text.clone() },
            WireBlock::Thinking { thinking, signature } => BlockState::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            },
            WireBlock::ToolUse { id, name, input } => BlockState::ToolUse {
                id: id.clone(),
                name: name.clone(),
                seed: input.clone(),
                partial_json: String::new(),
            },
            WireBlock::ToolResult { .. } | WireBlock::Unknown => {
                tracing::debug!(index, "ignoring non-assembled block kind");
                return;
            }
        };
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(Slot { state, complete: false });
    }

    /// Append a fragment. Returns `false` when nothing was applied (unknown
    /// index, completed block, or a delta kind that doesn't fit the block).
    pub fn apply_delta(&mut self, index: usize, delta: &BlockDelta) -> bool {
        let Some(Some(slot)) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.complete {
            return false;
        }
        match (&mut slot.state, delta) {
            (BlockState::Text { text }, BlockDelta::Text { text: frag }) => text.push_str(frag),
            (BlockState::Thinking { thinking, .. }, BlockDelta::Thinking { thinking: frag }) => {
                thinking.push_str(frag)
            }
            (BlockState::Thinking { signature, .. }, BlockDelta::Signature { signature: frag }) => {
                signature.get_or_insert_with(String::new).push_str(frag)
            }
            (BlockState::ToolUse { partial_json, .. }, BlockDelta::InputJson { partial_json: frag }) => {
                partial_json.push_str(frag)
            }
            _ => return false,
        }
        true
    }

    /// Mark the block at `index` complete and return its finalized form.
    pub fn stop_block(&mut self, index: usize) -> Option<ContentBlock> {
        let slot = self.slots.get_mut(index)?.as_mut()?;
        slot.complete = true;
        Some(finalize(&slot.state))
    }

    /// Finalized blocks in index order, including ones never stopped.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        self.slots.iter().flatten().map(|s| finalize(&s.state)).collect()
    }

    /// Take the assembled blocks and reset for the next message.
    pub fn take(&mut self) -> Vec<ContentBlock> {
        let blocks = self.blocks();
        self.reset(None);
        blocks
    }
}

fn finalize(state: &BlockState) -> ContentBlock {
    match state {
        BlockState::Text { text } => ContentBlock::Text { text: text.clone() },
        BlockState::Thinking { thinking, signature } => ContentBlock::Thinking {
            thinking: thinking.clone(),
            signature: signature.clone(),
        },
        BlockState::ToolUse { id, name, seed, partial_json } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: tool_input(id, seed, partial_json),
        },
    }
}

fn tool_input(id: &str, seed: &Value, partial_json: &str) -> Value {
    if partial_json.trim().is_empty() {
        return if seed.is_null() { Value::Object(Default::default()) } else { seed.clone() };
    }
    match serde_json::from_str(partial_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(tool_use_id = id, error = %e, "tool input JSON incomplete, using seed");
            if seed.is_null() {
                Value::Object(Default::default())
            } else {
                seed.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_start() -> WireBlock {
        WireBlock::Text { text: String::new() }
    }

    fn text_delta(s: &str) -> BlockDelta {
        BlockDelta::Text { text: s.into() }
    }

    #[test]
    fn text_block_concatenates_deltas() {
        let mut a = ContentAssembler::new();
        a.start_block(0, &text_start());
        assert!(a.apply_delta(0, &text_delta("Hel")));
        assert!(a.apply_delta(0, &text_delta("lo")));
        assert_eq!(a.stop_block(0), Some(ContentBlock::text("Hello")));
    }

    #[test]
    fn tool_input_assembled_from_partial_json() {
        let mut a = ContentAssembler::new();
        a.start_block(
            1,
            &WireBlock::ToolUse { id: "toolu_1".into(), name: "AskUserQuestion".into(), input: json!({}) },
        );
        a.apply_delta(1, &BlockDelta::InputJson { partial_json: "{\"questions\":".into() });
        a.apply_delta(1, &BlockDelta::InputJson { partial_json: "[{\"question\":\"Why?\"}]}".into() });
        let block = a.stop_block(1).unwrap();
        assert_eq!(
            block,
            ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "AskUserQuestion".into(),
                input: json!({"questions": [{"question": "Why?"}]}),
            }
        );
    }

    #[test]
    fn tool_without_deltas_keeps_seed_input() {
        let mut a = ContentAssembler::new();
        a.start_block(0, &WireBlock::ToolUse { id: "t".into(), name: "Read".into(), input: json!({"file_path": "/a"}) });
        let ContentBlock::ToolUse { input, .. } = a.stop_block(0).unwrap() else { unreachable!() };
        assert_eq!(input, json!({"file_path": "/a"}));
    }

    #[test]
    fn truncated_json_falls_back_to_empty_object() {
        let mut a = ContentAssembler::new();
        a.start_block(0, &WireBlock::ToolUse { id: "t".into(), name: "Bash".into(), input: Value::Null });
        a.apply_delta(0, &BlockDelta::InputJson { partial_json: "{\"command\": \"ls".into() });
        let ContentBlock::ToolUse { input, .. } = a.stop_block(0).unwrap() else { unreachable!() };
        assert_eq!(input, json!({}));
    }

    #[test]
    fn thinking_collects_signature() {
        let mut a = ContentAssembler::new();
        a.start_block(0, &WireBlock::Thinking { thinking: String::new(), signature: None });
        a.apply_delta(0, &BlockDelta::Thinking { thinking: "step 1".into() });
        a.apply_delta(0, &BlockDelta::Signature { signature: "abc".into() });
        a.apply_delta(0, &BlockDelta::Signature { signature: "def".into() });
        assert_eq!(
            a.stop_block(0),
            Some(ContentBlock::Thinking { thinking: "step 1".into(), signature: Some("abcdef".into()) })
        );
    }

    #[test]
    fn out_of_range_calls_are_noops() {
        let mut a = ContentAssembler::new();
        assert!(!a.apply_delta(5, &text_delta("x")));
        assert!(a.stop_block(5).is_none());
        a.start_block(3, &text_start());
        // slots 0..3 were grown lazily but are empty
        assert!(!a.apply_delta(1, &text_delta("x")));
        assert!(a.stop_block(1).is_none());
        assert_eq!(a.blocks().len(), 1);
    }

    #[test]
    fn huge_index_is_dropped() {
        let mut a = ContentAssembler::new();
        a.start_block(usize::MAX, &text_start());
        a.start_block(1 << 32, &text_start());
        a.start_block(MAX_BLOCKS, &text_start());
        assert!(a.is_empty());
        assert!(!a.apply_delta(usize::MAX, &text_delta("x")));
        assert!(a.stop_block(usize::MAX).is_none());

        a.start_block(MAX_BLOCKS - 1, &text_start());
        assert!(a.apply_delta(MAX_BLOCKS - 1, &text_delta("x")));
        assert_eq!(a.blocks().len(), 1);
    }

    #[test]
    fn mismatched_delta_kind_ignored() {
        let mut a = ContentAssembler::new();
        a.start_block(0, &text_start());
        assert!(!a.apply_delta(0, &BlockDelta::InputJson { partial_json: "{}".into() }));
        assert!(!a.apply_delta(0, &BlockDelta::Other));
    }

    #[test]
    fn deltas_after_stop_are_ignored() {
        let mut a = ContentAssembler::new();
        a.start_block(0, &text_start());
        a.apply_delta(0, &text_delta("done"));
        a.stop_block(0);
        assert!(!a.apply_delta(0, &text_delta(" more")));
        assert_eq!(a.blocks(), vec![ContentBlock::text("done")]);
    }

    #[test]
    fn restart_overwrites_slot() {
        let mut a = ContentAssembler::new();
        a.start_block(0, &text_start());
        a.apply_delta(0, &text_delta("stale"));
        a.start_block(0, &text_start());
        a.apply_delta(0, &text_delta("fresh"));
        assert_eq!(a.stop_block(0), Some(ContentBlock::text("fresh")));
    }

    #[test]
    fn take_returns_index_order_and_resets() {
        let mut a = ContentAssembler::new();
        a.reset(Some("msg_1".into()));
        a.start_block(1, &text_start());
        a.start_block(0, &WireBlock::Thinking { thinking: "t".into(), signature: None });
        a.apply_delta(1, &text_delta("answer"));
        assert_eq!(a.message_id(), Some("msg_1"));
        let blocks = a.take();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind(), "thinking");
        assert_eq!(blocks[1], ContentBlock::text("answer"));
        assert!(a.is_empty());
        assert!(a.message_id().is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn interleaved_text_blocks_equal_their_deltas(
                fragments in proptest::collection::vec(
                    proptest::collection::vec("[a-zA-Z0-9 ]{0,8}", 0..12),
                    1..5,
                ),
                seed in any::<u64>(),
            ) {
                let mut a = ContentAssembler::new();
                for i in 0..fragments.len() {
                    a.start_block(i, &text_start());
                }

                // Interleave deltas across blocks while keeping per-block order.
                let mut cursors = vec![0usize; fragments.len()];
                let mut state = seed;
                loop {
                    let open: Vec<usize> = (0..fragments.len()).filter(|&i| cursors[i] < fragments[i].len()).collect();
                    if open.is_empty() {
                        break;
                    }
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let pick = open[(state >> 33) as usize % open.len()];
                    a.apply_delta(pick, &text_delta(&fragments[pick][cursors[pick]]));
                    cursors[pick] += 1;
                }

                for (i, frags) in fragments.iter().enumerate() {
                    let expected: String = frags.concat();
                    prop_assert_eq!(a.stop_block(i), Some(ContentBlock::Text { text: expected }));
                }
            }
        }
    }
}
