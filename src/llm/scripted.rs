use std::collections::{HashMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::prompts::stage_marker;
use super::{GenerationBackend, GenerationRequest, GenerationResponse};
use crate::error::TransportFailure;

/// One canned backend reply
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(TransportFailure),
}

impl ScriptedReply {
    pub fn json(value: &Value) -> Self {
        ScriptedReply::Text(value.to_string())
    }
}

/// Deterministic backend that replays canned replies.
///
/// Replies are routed by the stage marker in the prompt; stages without
/// their own script fall back to the shared queue. The last reply of a
/// stage script is sticky so re-runs keep getting an answer.
pub struct ScriptedBackend {
    name: String,
    shared: Mutex<VecDeque<ScriptedReply>>,
    by_stage: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            shared: Mutex::new(VecDeque::new()),
            by_stage: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Load per-stage scripts from a JSON file of `{stage: [reply, ...]}`.
    ///
    /// String replies are sent verbatim; any other JSON value is serialized.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script: {:?}", path))?;
        let scripts: HashMap<String, Vec<Value>> =
            serde_json::from_str(&content).context("Failed to parse script JSON")?;

        let backend = Self::new().with_name(format!("scripted:{}", path.display()));
        for (stage, replies) in scripts {
            for reply in replies {
                let reply = match reply {
                    Value::String(text) => ScriptedReply::Text(text),
                    other => ScriptedReply::json(&other),
                };
                backend.push_for_stage(&stage, reply);
            }
        }
        Ok(backend)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Queue a reply for any stage
    pub fn push(&self, reply: ScriptedReply) {
        self.shared.lock().push_back(reply);
    }

    /// Queue a reply for a specific stage
    pub fn push_for_stage(&self, stage: &str, reply: ScriptedReply) {
        self.by_stage
            .lock()
            .entry(stage.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of calls whose prompt carried the given stage marker
    pub fn calls_for_stage(&self, stage: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| stage_marker(r).is_some_and(|m| m.stage == stage))
            .count()
    }

    fn next_reply(&self, request: &GenerationRequest) -> Option<ScriptedReply> {
        if let Some(marker) = stage_marker(request) {
            let mut by_stage = self.by_stage.lock();
            if let Some(queue) = by_stage.get_mut(&marker.stage) {
                if queue.len() > 1 {
                    return queue.pop_front();
                }
                if let Some(last) = queue.front() {
                    return Some(last.clone());
                }
            }
        }
        self.shared.lock().pop_front()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn id(&self) -> String {
        self.name.clone()
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, TransportFailure> {
        self.requests.lock().push(request.clone());

        match self.next_reply(request) {
            Some(ScriptedReply::Text(text)) => Ok(GenerationResponse {
                text,
                backend: self.name.clone(),
            }),
            Some(ScriptedReply::Fail(failure)) => Err(failure),
            None => Err(TransportFailure::Response(
                "scripted backend has no reply queued".to_string(),
            )),
        }
    }
}
