//! Intents: named, parameterised actions with a spoken response template.

pub mod recognition;
pub mod registry;

pub use recognition::{IntentMatch, LocalIntentRecognition};
pub use registry::IntentRegistry;

use crate::error::{panic_message, EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

pub type Parameters = BTreeMap<String, String>;

/// Bound behaviour of an intent. Receives a snapshot of the parameters and
/// the intent itself, so it may call `set_parameter` / `add_parameter`.
pub type IntentAction = Arc<dyn Fn(&Parameters, &Intent) + Send + Sync>;

/// Highest index of a scored response variant.
pub const MAX_SCORE_INDEX: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentType {
    Question,
    #[default]
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Curiosity,
    Playfulness,
    Empathy,
    Assertiveness,
    Attentiveness,
    Caution,
    Annoyance,
}

/// Target band for one emotion, on the personality's 0-100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionRange {
    pub emotion: Emotion,
    pub min: f32,
    pub max: f32,
}

/// Source of the device's current emotional state.
pub trait EmotionScorer: Send + Sync {
    /// Match score in 0..=100 of the current state against `ranges`.
    fn match_score(&self, ranges: &[EmotionRange]) -> f32;
}

/// Maps a 0-100 match score onto a scored-response index.
pub fn interpret_score(score: f32) -> usize {
    if score == 0.0 {
        0
    } else if score < 35.0 {
        1
    } else if score < 60.0 {
        2
    } else if score < 75.0 {
        3
    } else if score < 90.0 {
        4
    } else {
        5
    }
}

#[derive(Debug, Clone, Default)]
struct IntentState {
    parameters: Parameters,
    brief_desc: String,
    response_string: String,
    scored_responses: Vec<String>,
    emotion_ranges: Vec<EmotionRange>,
    matching_params: Vec<String>,
    matching_phrases: Vec<String>,
}

pub struct Intent {
    name: String,
    intent_type: IntentType,
    action: RwLock<Option<IntentAction>>,
    state: RwLock<IntentState>,
}

impl fmt::Debug for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intent")
            .field("name", &self.name)
            .field("type", &self.intent_type)
            .field("parameters", &self.parameters())
            .field("has_action", &self.has_action())
            .finish()
    }
}

impl Intent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            intent_type: IntentType::Command,
            action: RwLock::new(None),
            state: RwLock::new(IntentState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IntentState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IntentState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&mut self) -> &mut IntentState {
        self.state.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_action<F>(self, action: F) -> Self
    where
        F: Fn(&Parameters, &Intent) + Send + Sync + 'static,
    {
        self.set_action(action);
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.state_mut().parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state_mut().parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_brief_desc(mut self, brief_desc: impl Into<String>) -> Self {
        self.state_mut().brief_desc = brief_desc.into();
        self
    }

    pub fn with_response_string(mut self, response: impl Into<String>) -> Self {
        self.state_mut().response_string = response.into();
        self
    }

    pub fn with_type(mut self, intent_type: IntentType) -> Self {
        self.intent_type = intent_type;
        self
    }

    pub fn with_matching_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state_mut().matching_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_matching_phrases<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state_mut().matching_phrases = phrases.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn intent_type(&self) -> IntentType {
        self.intent_type
    }

    pub fn set_action<F>(&self, action: F)
    where
        F: Fn(&Parameters, &Intent) + Send + Sync + 'static,
    {
        *self.action.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(action));
    }

    pub fn has_action(&self) -> bool {
        self.action
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn parameters(&self) -> Parameters {
        self.read().parameters.clone()
    }

    pub fn parameter(&self, key: &str) -> Option<String> {
        self.read().parameters.get(key).cloned()
    }

    pub fn set_parameters(&self, parameters: Parameters) {
        self.write().parameters = parameters;
    }

    /// Updates an existing key only. Returns false when `key` is unknown.
    pub fn set_parameter(&self, key: &str, value: impl Into<String>) -> bool {
        match self.write().parameters.get_mut(key) {
            Some(slot) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    pub fn add_parameter(&self, key: impl Into<String>, value: impl Into<String>) {
        self.write().parameters.insert(key.into(), value.into());
    }

    pub fn brief_desc(&self) -> String {
        self.read().brief_desc.clone()
    }

    pub fn set_brief_desc(&self, brief_desc: impl Into<String>) {
        self.write().brief_desc = brief_desc.into();
    }

    pub fn set_response_string(&self, response: impl Into<String>) {
        self.write().response_string = response.into();
    }

    /// Runs the bound action with a snapshot of the parameters. No lock is
    /// held while the action runs.
    pub fn execute(&self) -> EngineResult<()> {
        let action = self
            .action
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| EngineError::NoActionSet(self.name.clone()))?;
        let params = self.parameters();
        debug!("[Intent] Executing '{}'", self.name);
        catch_unwind(AssertUnwindSafe(|| action(&params, self))).map_err(|payload| {
            EngineError::ActionPanicked {
                name: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }
        })
    }

    fn fill_template(&self, template: &str, parameters: &Parameters) -> String {
        let mut out = template.to_string();
        let mut all_found = true;
        for (key, value) in parameters {
            let placeholder = format!("${{{}}}", key);
            if out.contains(&placeholder) {
                out = out.replace(&placeholder, value);
            } else {
                all_found = false;
            }
        }
        if !all_found {
            debug!(
                "[Intent] Not every parameter of '{}' appears in its response",
                self.name
            );
        }
        out
    }

    /// Response template with `${key}` placeholders filled in.
    pub fn response_string(&self) -> String {
        let state = self.read();
        self.fill_template(&state.response_string, &state.parameters)
    }

    /// Like `response_string`, but picks the scored variant for the current
    /// emotional state when variants exist.
    pub fn response_string_scored(&self, scorer: &dyn EmotionScorer) -> String {
        let state = self.read();
        let mut template = state.response_string.as_str();
        if !state.scored_responses.is_empty() {
            let index = interpret_score(scorer.match_score(&state.emotion_ranges));
            match state.scored_responses.get(index) {
                Some(variant) => template = variant.as_str(),
                None => warn!(
                    "[Intent] Score index {} out of range for '{}'",
                    index, self.name
                ),
            }
        }
        self.fill_template(template, &state.parameters)
    }

    pub fn scored_responses(&self) -> Vec<String> {
        self.read().scored_responses.clone()
    }

    /// Replaces the scored variants, keeping at most six.
    pub fn set_scored_response_strings(&self, responses: Vec<String>) {
        if responses.len() > MAX_SCORE_INDEX + 1 {
            warn!(
                "[Intent] Too many scored responses for '{}'; keeping the first {}",
                self.name,
                MAX_SCORE_INDEX + 1
            );
        }
        self.write().scored_responses = responses.into_iter().take(MAX_SCORE_INDEX + 1).collect();
    }

    /// Sets the variant for `score` (clamped to 0..=5). Gaps below it are
    /// filled with the previous last variant.
    pub fn set_scored_response_string(&self, response: impl Into<String>, score: i32) {
        let index = if score < 0 || score > MAX_SCORE_INDEX as i32 {
            warn!(
                "[Intent] Score {} out of range for '{}'; clamping",
                score, self.name
            );
            score.clamp(0, MAX_SCORE_INDEX as i32) as usize
        } else {
            score as usize
        };
        let mut state = self.write();
        let filler = state.scored_responses.last().cloned().unwrap_or_default();
        while state.scored_responses.len() <= index {
            state.scored_responses.push(filler.clone());
        }
        state.scored_responses[index] = response.into();
    }

    pub fn emotion_ranges(&self) -> Vec<EmotionRange> {
        self.read().emotion_ranges.clone()
    }

    pub fn set_emotion_ranges(&self, ranges: Vec<EmotionRange>) {
        self.write().emotion_ranges = ranges;
    }

    /// Replaces the range for the same emotion, or appends it.
    pub fn set_emotion_range(&self, range: EmotionRange) {
        let mut state = self.write();
        match state
            .emotion_ranges
            .iter_mut()
            .find(|r| r.emotion == range.emotion)
        {
            Some(existing) => *existing = range,
            None => state.emotion_ranges.push(range),
        }
    }

    pub fn matching_params(&self) -> Vec<String> {
        self.read().matching_params.clone()
    }

    pub fn set_matching_params(&self, params: Vec<String>) {
        self.write().matching_params = params;
    }

    pub fn matching_phrases(&self) -> Vec<String> {
        self.read().matching_phrases.clone()
    }

    pub fn set_matching_phrases(&self, phrases: Vec<String>) {
        self.write().matching_phrases = phrases;
    }

    pub fn serialize(&self) -> Value {
        let state = self.read();
        json!({
            "intentName": self.name,
            "parameters": state.parameters,
            "briefDesc": state.brief_desc,
            "responseString": state.response_string,
            "type": self.intent_type,
        })
    }

    /// Rebuilds an intent from `serialize()` output. The action is not
    /// carried and must be bound again.
    pub fn deserialize(value: &Value) -> EngineResult<Intent> {
        let name = value
            .get("intentName")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::InvalidPayload("missing 'intentName'".to_string()))?;
        let parameters: Parameters = match value.get("parameters") {
            None | Some(Value::Null) => Parameters::new(),
            Some(p) => serde_json::from_value(p.clone())
                .map_err(|e| EngineError::InvalidPayload(format!("parameters: {}", e)))?,
        };
        let intent_type = match value.get("type") {
            None | Some(Value::Null) => IntentType::default(),
            Some(t) => serde_json::from_value(t.clone())
                .map_err(|e| EngineError::InvalidPayload(format!("type: {}", e)))?,
        };
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(Intent::new(name)
            .with_type(intent_type)
            .with_parameters(parameters)
            .with_brief_desc(text("briefDesc"))
            .with_response_string(text("responseString")))
    }
}
