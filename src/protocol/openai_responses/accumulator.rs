use std::collections::BTreeMap;

use super::{
    ResponsesContentPart, ResponsesErrorBody, ResponsesOutput, ResponsesOutputItem,
    ResponsesStreamEvent, ResponsesSummaryPart,
};

/// Rebuilds a Responses response object from its event stream.
///
/// The object from `response.created` is the base; items are tracked by
/// `output_index` and replaced wholesale by `response.output_item.done`. A
/// terminal response event overrides everything except an empty `output`,
/// which is filled from the tracked items.
#[derive(Debug, Clone, Default)]
pub struct ResponsesAccumulator {
    base: Option<ResponsesOutput>,
    items: BTreeMap<usize, ResponsesOutputItem>,
    terminal: Option<ResponsesOutput>,
    error: Option<ResponsesErrorBody>,
    last_sequence_number: Option<u64>,
}

impl ResponsesAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &ResponsesStreamEvent) {
        if let Some(seq) = event.sequence_number() {
            self.last_sequence_number = Some(self.last_sequence_number.map_or(seq, |last| last.max(seq)));
        }
        match event {
            ResponsesStreamEvent::ResponseCreated { response, .. }
            | ResponsesStreamEvent::ResponseInProgress { response, .. } => {
                self.base = Some(response.clone());
            }
            ResponsesStreamEvent::ResponseCompleted { response, .. }
            | ResponsesStreamEvent::ResponseIncomplete { response, .. }
            | ResponsesStreamEvent::ResponseFailed { response, .. } => {
                if let Some(error) = &response.error {
                    self.error = Some(error.clone());
                }
                self.terminal = Some(response.clone());
            }
            ResponsesStreamEvent::OutputItemAdded { output_index, item, .. }
            | ResponsesStreamEvent::OutputItemDone { output_index, item, .. } => {
                self.items.insert(*output_index, item.clone());
            }
            ResponsesStreamEvent::ContentPartAdded {
                output_index,
                content_index,
                part,
                ..
            } => {
                if let Some(ResponsesOutputItem::Message { content, .. }) =
                    self.items.get_mut(output_index)
                {
                    if content.len() <= *content_index {
                        content.resize(
                            *content_index + 1,
                            ResponsesContentPart::output_text(String::new()),
                        );
                    }
                    content[*content_index] = part.clone();
                }
            }
            ResponsesStreamEvent::OutputTextDelta {
                item_id,
                output_index,
                content_index,
                delta,
                ..
            } => {
                let item = self
                    .items
                    .entry(*output_index)
                    .or_insert_with(|| ResponsesOutputItem::Message {
                        id: item_id.clone(),
                        status: Some("in_progress".to_string()),
                        role: "assistant".to_string(),
                        content: Vec::new(),
                    });
                if let ResponsesOutputItem::Message { content, .. } = item {
                    if content.len() <= *content_index {
                        content.resize(
                            *content_index + 1,
                            ResponsesContentPart::output_text(String::new()),
                        );
                    }
                    if let ResponsesContentPart::OutputText { text, .. } = &mut content[*content_index] {
                        text.push_str(delta);
                    }
                }
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta {
                item_id,
                output_index,
                summary_index,
                delta,
                ..
            } => {
                let item = self
                    .items
                    .entry(*output_index)
                    .or_insert_with(|| ResponsesOutputItem::Reasoning {
                        id: item_id.clone(),
                        summary: Vec::new(),
                        encrypted_content: None,
                        status: None,
                    });
                if let ResponsesOutputItem::Reasoning { summary, .. } = item {
                    if summary.len() <= *summary_index {
                        summary.resize(
                            *summary_index + 1,
                            ResponsesSummaryPart::SummaryText {
                                text: String::new(),
                            },
                        );
                    }
                    let ResponsesSummaryPart::SummaryText { text } = &mut summary[*summary_index];
                    text.push_str(delta);
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta {
                output_index, delta, ..
            } => {
                if let Some(ResponsesOutputItem::FunctionCall { arguments, .. }) =
                    self.items.get_mut(output_index)
                {
                    arguments.push_str(delta);
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone {
                output_index,
                arguments: done,
                ..
            } => {
                if let Some(ResponsesOutputItem::FunctionCall { arguments, .. }) =
                    self.items.get_mut(output_index)
                {
                    arguments.clone_from(done);
                }
            }
            ResponsesStreamEvent::Error { code, message, .. } => {
                self.error = Some(ResponsesErrorBody {
                    code: code.clone(),
                    message: message.clone(),
                });
            }
            ResponsesStreamEvent::ContentPartDone { .. }
            | ResponsesStreamEvent::OutputTextDone { .. }
            | ResponsesStreamEvent::ReasoningSummaryPartAdded { .. }
            | ResponsesStreamEvent::ReasoningSummaryPartDone { .. }
            | ResponsesStreamEvent::ReasoningSummaryTextDone { .. }
            | ResponsesStreamEvent::Unknown => {}
        }
    }

    /// Response assembled from everything observed so far.
    #[must_use]
    pub fn snapshot(&self) -> ResponsesOutput {
        let mut response = self
            .terminal
            .clone()
            .or_else(|| self.base.clone())
            .unwrap_or_else(|| ResponsesOutput {
                object: "response".to_string(),
                ..ResponsesOutput::default()
            });
        if response.output.is_empty() {
            response.output = self.items.values().cloned().collect();
        }
        response
    }

    /// The completed response once a terminal event was seen.
    /// Each call returns an independent copy.
    #[must_use]
    pub fn final_response(&self) -> Option<ResponsesOutput> {
        self.terminal.is_some().then(|| self.snapshot())
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some() || self.error.is_some()
    }

    #[must_use]
    pub fn error(&self) -> Option<&ResponsesErrorBody> {
        self.error.as_ref()
    }

    /// Current state of the item at `output_index`.
    #[must_use]
    pub fn item(&self, output_index: usize) -> Option<&ResponsesOutputItem> {
        self.items.get(&output_index)
    }

    /// Highest `sequence_number` observed, if any.
    #[must_use]
    pub fn last_sequence_number(&self) -> Option<u64> {
        self.last_sequence_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn event(value: Value) -> ResponsesStreamEvent {
        serde_json::from_value(value).unwrap()
    }

    fn stream() -> Vec<ResponsesStreamEvent> {
        vec![
            event(json!({"type": "response.created", "sequence_number": 0, "response": {
                "id": "resp_1", "object": "response", "model": "gpt-4o", "status": "in_progress",
                "output": []}})),
            event(json!({"type": "response.output_item.added", "sequence_number": 1, "output_index": 0,
                "item": {"type": "message", "id": "msg_1", "role": "assistant", "content": []}})),
            event(json!({"type": "response.content_part.added", "sequence_number": 2,
                "item_id": "msg_1", "output_index": 0, "content_index": 0,
                "part": {"type": "output_text", "text": "", "annotations": []}})),
            event(json!({"type": "response.output_text.delta", "sequence_number": 3,
                "item_id": "msg_1", "output_index": 0, "content_index": 0, "delta": "Hel"})),
            event(json!({"type": "response.output_text.delta", "sequence_number": 4,
                "item_id": "msg_1", "output_index": 0, "content_index": 0, "delta": "lo"})),
        ]
    }

    #[test]
    fn test_snapshot_mid_stream_and_terminal_fill() {
        let mut acc = ResponsesAccumulator::new();
        for ev in &stream() {
            acc.push(ev);
        }
        assert!(acc.final_response().is_none());
        assert_eq!(acc.last_sequence_number(), Some(4));
        let snapshot = acc.snapshot();
        assert_eq!(
            snapshot.output,
            vec![ResponsesOutputItem::Message {
                id: "msg_1".into(),
                status: None,
                role: "assistant".into(),
                content: vec![ResponsesContentPart::output_text("Hello".into())],
            }]
        );

        acc.push(&event(json!({"type": "response.completed", "sequence_number": 5, "response": {
            "id": "resp_1", "object": "response", "model": "gpt-4o", "status": "completed",
            "output": []}})));
        let done = acc.final_response().unwrap();
        assert_eq!(done.status.as_deref(), Some("completed"));
        assert_eq!(done.output.len(), 1);
    }

    #[test]
    fn test_final_response_is_a_defensive_copy() {
        let mut acc = ResponsesAccumulator::new();
        for ev in &stream() {
            acc.push(ev);
        }
        acc.push(&event(json!({"type": "response.completed", "sequence_number": 5, "response": {
            "id": "resp_1", "object": "response", "model": "gpt-4o", "status": "completed",
            "output": []}})));
        let mut first = acc.final_response().unwrap();
        first.output.clear();
        first.status = None;
        let second = acc.final_response().unwrap();
        assert_eq!(second.output.len(), 1);
        assert_eq!(second.status.as_deref(), Some("completed"));
    }
}
