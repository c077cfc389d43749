//! Tool call folding

use serde::{Deserialize, Serialize};

use super::events::ToolCallDelta;

/// Tool call (invocation from model)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Default)]
struct PendingCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

/// Collects streamed tool call fragments into final ToolCall objects.
/// This is intentionally tolerant: if JSON parsing fails, it keeps the raw string.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: Vec<PendingCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn on_delta(&mut self, delta: &ToolCallDelta) {
        let pos = self.calls.iter().position(|c| c.index == delta.index);
        let call = match pos {
            Some(i) => &mut self.calls[i],
            None => {
                self.calls.push(PendingCall {
                    index: delta.index,
                    ..Default::default()
                });
                let last = self.calls.len() - 1;
                &mut self.calls[last]
            }
        };
        if let Some(id) = &delta.id {
            call.id = id.clone();
        }
        if let Some(name) = &delta.name {
            call.name = name.clone();
        }
        call.arguments.push_str(&delta.arguments);
    }

    pub fn finalize(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .map(|c| {
                let trimmed = c.arguments.trim();
                let arguments = if trimmed.is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    serde_json::from_str(trimmed)
                        .unwrap_or_else(|_| serde_json::Value::String(c.arguments.clone()))
                };
                ToolCall {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    arguments,
                }
            })
            .collect()
    }
}
