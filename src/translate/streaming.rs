//! State machine for translating backend stream chunks into Anthropic SSE events.
//!
//! The [`StreamTranslator`] consumes the [`ChunkEvent`]s of one backend chunk at a
//! time, maintaining state about which content blocks are open, and emitting the
//! corresponding Anthropic stream events (`message_start`, `content_block_delta`, etc.).
//!
//! Block indices are assigned when a block opens and never reused. Text deltas
//! always go to a single open text block; tool blocks may stay open side by side
//! so interleaved argument fragments are routed by backend slot or call id.

use std::collections::{BTreeMap, HashMap};

use super::adapter::ChunkEvent;
use super::anthropic_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StopReason,
    StreamEvent, Usage,
};
use super::response::{fallback_tool_id, new_message_id, parse_tool_arguments};

#[derive(Debug)]
enum OpenBlock {
    Text,
    Tool {
        id: String,
        name: String,
        /// Concatenated argument fragments, checked when the block closes.
        arguments: String,
    },
}

enum Route {
    Existing(usize),
    Open,
    Drop,
}

/// State machine that translates backend chunks into Anthropic SSE events.
///
/// Usage:
///   let mut translator = StreamTranslator::new("claude-sonnet-4-20250514");
///   for chunk in backend_chunks {
///       let events = translator.process_events(adapter.chunk_events(chunk));
///       // send each event as SSE
///   }
///   let final_events = translator.finish();
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    msg_id: String,
    started: bool,
    finished: bool,
    next_index: usize,
    open_blocks: BTreeMap<usize, OpenBlock>,
    /// backend tool slot -> block index
    tool_slots: HashMap<u64, usize>,
    /// Block index of the most recently opened tool block
    last_tool_block: Option<usize>,
    saw_tool_use: bool,
    stop_reason: Option<StopReason>,
    usage_seen: bool,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamTranslator {
    pub fn new(model: &str) -> Self {
        Self::with_message_id(model, new_message_id())
    }

    /// Translator with a fixed message id; output is then a pure function of the input.
    pub fn with_message_id(model: &str, msg_id: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            msg_id: msg_id.into(),
            started: false,
            finished: false,
            next_index: 0,
            open_blocks: BTreeMap::new(),
            tool_slots: HashMap::new(),
            last_tool_block: None,
            saw_tool_use: false,
            stop_reason: None,
            usage_seen: false,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.msg_id
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Process the events decoded from one backend chunk.
    pub fn process_events(&mut self, chunk_events: Vec<ChunkEvent>) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();

        // Emit message_start on first chunk
        if !self.started {
            events.push(self.make_message_start());
            self.started = true;
        }

        for event in chunk_events {
            match event {
                ChunkEvent::Text(text) => self.push_text(text, &mut events),
                ChunkEvent::ToolCallFragment {
                    slot,
                    id,
                    name,
                    arguments,
                } => self.push_tool_fragment(slot, id, name, arguments, &mut events),
                ChunkEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    if let Some(n) = input_tokens {
                        self.input_tokens = n;
                    }
                    if let Some(n) = output_tokens {
                        self.output_tokens = n;
                    }
                    self.usage_seen = true;
                }
                ChunkEvent::Finish(reason) => {
                    self.close_all(&mut events);
                    self.stop_reason.get_or_insert(reason);
                }
                ChunkEvent::Error(message) => {
                    tracing::error!(error = %message, "Backend reported an error mid-stream");
                    events.append(&mut self.make_finish_events(StopReason::Error));
                    return events;
                }
            }
        }

        // Stop as soon as both the finish reason and usage totals are known.
        if let (Some(reason), true) = (self.stop_reason, self.usage_seen) {
            events.append(&mut self.make_finish_events(reason));
        }

        events
    }

    /// Call when the backend stream ends to flush any remaining events.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        if !self.started {
            events.push(self.make_message_start());
            self.started = true;
        }

        // No finish marker seen: infer from what was streamed
        let reason = self.stop_reason.unwrap_or(if self.saw_tool_use {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        events.append(&mut self.make_finish_events(reason));
        events
    }

    /// Terminate the stream abnormally: close every open block and stop with
    /// the `error` stop reason.
    pub fn fail(&mut self, message: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        tracing::error!(error = %message, "Stream terminated abnormally");

        let mut events = Vec::new();
        if !self.started {
            events.push(self.make_message_start());
            self.started = true;
        }
        events.append(&mut self.make_finish_events(StopReason::Error));
        events
    }

    fn push_text(&mut self, text: String, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }

        let index = match self.open_text_block() {
            Some(index) => index,
            None => {
                // Tool blocks stay open so their later fragments still land
                let index = self.open_block(OpenBlock::Text);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseContentBlock::Text {
                        text: String::new(),
                    },
                });
                index
            }
        };

        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta { text },
        });
    }

    fn push_tool_fragment(
        &mut self,
        slot: Option<u64>,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
        events: &mut Vec<StreamEvent>,
    ) {
        let index = match self.route_fragment(slot, id.as_deref(), name.is_some()) {
            Route::Existing(index) => {
                if let Some(slot) = slot {
                    self.tool_slots.entry(slot).or_insert(index);
                }
                index
            }
            Route::Drop => {
                tracing::warn!(slot = ?slot, "Dropping fragment for a closed or unknown tool call");
                return;
            }
            Route::Open => {
                if let Some(text_index) = self.open_text_block() {
                    self.close_block(text_index, events);
                }

                let name = name.unwrap_or_default();
                let index = self.next_index;
                let tool_id = id.unwrap_or_else(|| fallback_tool_id(&self.msg_id, index));
                self.open_block(OpenBlock::Tool {
                    id: tool_id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });
                if let Some(slot) = slot {
                    self.tool_slots.insert(slot, index);
                }
                self.last_tool_block = Some(index);
                self.saw_tool_use = true;

                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseContentBlock::ToolUse {
                        id: tool_id,
                        name,
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                });
                index
            }
        };

        let Some(fragment) = arguments.filter(|a| !a.is_empty()) else {
            return;
        };
        if let Some(OpenBlock::Tool { arguments, .. }) = self.open_blocks.get_mut(&index) {
            arguments.push_str(&fragment);
        }
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta {
                partial_json: fragment,
            },
        });
    }

    fn route_fragment(&self, slot: Option<u64>, id: Option<&str>, has_name: bool) -> Route {
        // Some servers repeat the call id on every fragment, with or without a slot
        if let Some(index) = id.and_then(|id| self.open_tool_by_id(id)) {
            return Route::Existing(index);
        }

        let known = match slot {
            Some(slot) => self.tool_slots.get(&slot).copied(),
            None if id.is_none() => self.last_tool_block,
            None => None,
        };

        match known.filter(|index| self.is_open_tool(*index)) {
            Some(index) if id.is_none() => Route::Existing(index),
            _ if id.is_none() && !has_name => Route::Drop,
            _ => Route::Open,
        }
    }

    fn open_tool_by_id(&self, id: &str) -> Option<usize> {
        self.open_blocks.iter().find_map(|(index, block)| match block {
            OpenBlock::Tool { id: open_id, .. } if open_id == id => Some(*index),
            _ => None,
        })
    }

    fn open_block(&mut self, block: OpenBlock) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.open_blocks.insert(index, block);
        index
    }

    fn open_text_block(&self) -> Option<usize> {
        self.open_blocks
            .iter()
            .find(|(_, block)| matches!(block, OpenBlock::Text))
            .map(|(index, _)| *index)
    }

    fn is_open_tool(&self, index: usize) -> bool {
        matches!(self.open_blocks.get(&index), Some(OpenBlock::Tool { .. }))
    }

    fn close_block(&mut self, index: usize, events: &mut Vec<StreamEvent>) {
        let Some(block) = self.open_blocks.remove(&index) else {
            return;
        };
        if let OpenBlock::Tool { name, arguments, .. } = block {
            if let Err(e) = parse_tool_arguments(&name, &arguments) {
                tracing::warn!(error = %e, "Streamed tool arguments are not valid JSON");
            }
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    /// Close every open block in ascending index order.
    fn close_all(&mut self, events: &mut Vec<StreamEvent>) {
        let indices: Vec<usize> = self.open_blocks.keys().copied().collect();
        for index in indices {
            self.close_block(index, events);
        }
    }

    fn make_message_start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                    cache_creation_input_tokens: None,
                    cache_read_input_tokens: None,
                },
            },
        }
    }

    fn make_finish_events(&mut self, reason: StopReason) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        self.close_all(&mut events);
        self.tool_slots.clear();

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(reason),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                input_tokens: self.usage_seen.then_some(self.input_tokens),
                output_tokens: self.output_tokens,
            },
        });

        events.push(StreamEvent::MessageStop);

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &str) -> ChunkEvent {
        ChunkEvent::Text(t.to_string())
    }

    fn tool_start(slot: u64, id: &str, name: &str) -> ChunkEvent {
        ChunkEvent::ToolCallFragment {
            slot: Some(slot),
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments: None,
        }
    }

    fn tool_args(slot: u64, args: &str) -> ChunkEvent {
        ChunkEvent::ToolCallFragment {
            slot: Some(slot),
            id: None,
            name: None,
            arguments: Some(args.to_string()),
        }
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    #[test]
    fn test_simple_text_stream() {
        let mut translator = StreamTranslator::new("test-model");

        // First chunk
        let events = translator.process_events(vec![text("Hello")]);
        assert_eq!(
            names(&events),
            vec!["message_start", "content_block_start", "content_block_delta"]
        );

        // Second chunk
        let events = translator.process_events(vec![text(" world")]);
        assert_eq!(names(&events), vec!["content_block_delta"]);

        // Finish without usage waits for the end of the stream
        let events = translator.process_events(vec![ChunkEvent::Finish(StopReason::EndTurn)]);
        assert_eq!(names(&events), vec!["content_block_stop"]);

        let events = translator.finish();
        assert_eq!(names(&events), vec!["message_delta", "message_stop"]);
        assert!(translator.is_finished());
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn test_text_then_tool_call() {
        let mut translator = StreamTranslator::with_message_id("m", "msg_1");
        let mut events = translator.process_events(vec![text("Hel")]);
        events.extend(translator.process_events(vec![text("lo")]));
        events.extend(translator.process_events(vec![tool_start(0, "call_1", "get_weather")]));
        events.extend(translator.process_events(vec![tool_args(0, "{\"city\":")]));
        events.extend(translator.process_events(vec![tool_args(0, "\"sf\"}")]));
        events.extend(translator.process_events(vec![ChunkEvent::Finish(StopReason::ToolUse)]));
        events.extend(translator.finish());

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(
            events[5],
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: ResponseContentBlock::ToolUse {
                    id: "call_1".to_string(),
                    name: "get_weather".to_string(),
                    input: serde_json::json!({}),
                },
            }
        );
        assert_eq!(
            events[7],
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: Delta::InputJsonDelta {
                    partial_json: "\"sf\"}".to_string()
                },
            }
        );
        assert!(matches!(
            &events[9],
            StreamEvent::MessageDelta { delta, .. } if delta.stop_reason == Some(StopReason::ToolUse)
        ));
    }

    #[test]
    fn test_interleaved_tool_calls_routed_by_slot() {
        let mut translator = StreamTranslator::with_message_id("m", "msg_1");
        let mut events = translator.process_events(vec![
            tool_start(0, "call_a", "ls"),
            tool_start(1, "call_b", "pwd"),
        ]);
        events.extend(translator.process_events(vec![tool_args(1, "{}"), tool_args(0, "{\"p\":1}")]));

        assert_eq!(
            events[3],
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: Delta::InputJsonDelta {
                    partial_json: "{}".to_string()
                },
            }
        );
        assert!(matches!(events[4], StreamEvent::ContentBlockDelta { index: 0, .. }));

        let events = translator.process_events(vec![
            ChunkEvent::Finish(StopReason::ToolUse),
            ChunkEvent::Usage {
                input_tokens: Some(10),
                output_tokens: Some(4),
            },
        ]);
        assert_eq!(
            events,
            vec![
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::ContentBlockStop { index: 1 },
                StreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(StopReason::ToolUse),
                        stop_sequence: None,
                    },
                    usage: DeltaUsage {
                        input_tokens: Some(10),
                        output_tokens: 4,
                    },
                },
                StreamEvent::MessageStop,
            ]
        );
    }

    #[test]
    fn test_usage_after_finish_triggers_stop() {
        let mut translator = StreamTranslator::new("m");
        translator.process_events(vec![text("hi"), ChunkEvent::Finish(StopReason::MaxTokens)]);
        let events = translator.process_events(vec![ChunkEvent::Usage {
            input_tokens: Some(1),
            output_tokens: Some(2),
        }]);
        assert_eq!(names(&events), vec!["message_delta", "message_stop"]);
        assert!(translator.process_events(vec![text("late")]).is_empty());
    }

    #[test]
    fn test_error_closes_open_blocks() {
        let mut translator = StreamTranslator::new("m");
        let mut events = translator.process_events(vec![text("partial"), tool_start(0, "c", "ls")]);
        events.extend(translator.process_events(vec![ChunkEvent::Error("overloaded".to_string())]));

        let starts: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        let stops: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStop { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![0, 1]);
        assert_eq!(stops, vec![0, 1]);
        assert!(matches!(
            &events[events.len() - 2],
            StreamEvent::MessageDelta { delta, .. } if delta.stop_reason == Some(StopReason::Error)
        ));
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[test]
    fn test_fail_before_any_chunk() {
        let mut translator = StreamTranslator::new("m");
        let events = translator.fail("timed out");
        assert_eq!(names(&events), vec!["message_start", "message_delta", "message_stop"]);
    }

    #[test]
    fn test_finish_without_chunks() {
        let mut translator = StreamTranslator::new("test-model");
        let events = translator.finish();
        assert_eq!(names(&events), vec!["message_start", "message_delta", "message_stop"]);
    }

    #[test]
    fn test_fallback_tool_ids_are_deterministic() {
        let run = || {
            let mut translator = StreamTranslator::with_message_id("m", "msg_fixed");
            let mut events = translator.process_events(vec![ChunkEvent::ToolCallFragment {
                slot: Some(0),
                id: None,
                name: Some("ls".to_string()),
                arguments: Some("{}".to_string()),
            }]);
            events.extend(translator.finish());
            serde_json::to_string(&events).unwrap()
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.contains("toolu_fixed_0"));
        assert!(first.contains("\"stop_reason\":\"tool_use\""));
    }

    fn fragment(id: &str, name: Option<&str>, args: &str) -> ChunkEvent {
        ChunkEvent::ToolCallFragment {
            slot: None,
            id: Some(id.to_string()),
            name: name.map(str::to_string),
            arguments: Some(args.to_string()),
        }
    }

    fn starts(events: &[StreamEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_repeated_call_id_without_slot_continues_block() {
        let mut translator = StreamTranslator::with_message_id("m", "msg_1");
        let mut events = translator.process_events(vec![fragment("call_1", Some("get_weather"), "{\"city\":")]);
        events.extend(translator.process_events(vec![fragment("call_1", None, "\"sf\"}")]));
        events.extend(translator.finish());

        assert_eq!(starts(&events), vec![0]);
        assert_eq!(
            events[3],
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJsonDelta {
                    partial_json: "\"sf\"}".to_string()
                },
            }
        );
        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn test_text_between_tool_fragments_keeps_tool_open() {
        let mut translator = StreamTranslator::with_message_id("m", "msg_1");
        let mut events = translator.process_events(vec![tool_start(0, "call_a", "ls"), tool_args(0, "{\"p\":")]);
        events.extend(translator.process_events(vec![text("thinking aloud")]));
        events.extend(translator.process_events(vec![tool_args(0, "1}")]));
        events.extend(translator.process_events(vec![ChunkEvent::Finish(StopReason::ToolUse)]));

        let tool_json: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: Delta::InputJsonDelta { partial_json },
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tool_json, "{\"p\":1}");

        // Both stay open until the finish marker closes them in index order
        let stops: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStop { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![0, 1]);
    }
}
