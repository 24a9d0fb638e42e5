use super::{Intent, IntentType, Parameters};
use chrono::Local;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Name-keyed store of intents, pre-populated with the system intents.
pub struct IntentRegistry {
    intents: RwLock<HashMap<String, Arc<Intent>>>,
}

impl IntentRegistry {
    pub fn new() -> Self {
        let registry = Self::empty();
        for intent in system_intents() {
            registry.register_intent(Arc::new(intent));
        }
        registry
    }

    pub fn empty() -> Self {
        Self {
            intents: RwLock::new(HashMap::new()),
        }
    }

    /// Rejects empty and duplicate names.
    pub fn register_intent(&self, intent: Arc<Intent>) -> bool {
        let name = intent.name().to_string();
        if name.trim().is_empty() {
            warn!("[IntentRegistry] Rejecting intent with empty name");
            return false;
        }
        let mut intents = self.intents.write().unwrap_or_else(|e| e.into_inner());
        if intents.contains_key(&name) {
            warn!("[IntentRegistry] Intent '{}' already registered", name);
            return false;
        }
        info!("[IntentRegistry] Registered intent '{}'", name);
        intents.insert(name, intent);
        true
    }

    pub fn unregister_intent(&self, name: &str) -> bool {
        self.intents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn get_intent(&self, name: &str) -> Option<Arc<Intent>> {
        self.intents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn intent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .intents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn registered_intents(&self) -> Vec<Arc<Intent>> {
        let mut intents: Vec<Arc<Intent>> = self
            .intents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        intents.sort_by(|a, b| a.name().cmp(b.name()));
        intents
    }

    pub fn len(&self) -> usize {
        self.intents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IntentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn system_intents() -> Vec<Intent> {
    vec![
        Intent::new("ping")
            .with_brief_desc("Check that the decision engine is responsive")
            .with_response_string("pong")
            .with_matching_params(["ping"])
            .with_action(|_: &Parameters, _: &Intent| {
                info!("[IntentRegistry] ping");
            }),
        Intent::new("time")
            .with_type(IntentType::Question)
            .with_parameter("time", "")
            .with_brief_desc("Tell the current time")
            .with_response_string("The current time is ${time}")
            .with_matching_params(["clock"])
            .with_matching_phrases(["what time is it"])
            .with_action(|_: &Parameters, intent: &Intent| {
                intent.set_parameter("time", Local::now().format("%-I:%M %p").to_string());
            }),
        Intent::new("date")
            .with_type(IntentType::Question)
            .with_parameter("date", "")
            .with_brief_desc("Tell today's date")
            .with_response_string("Today is ${date}")
            .with_matching_params(["today", "day"])
            .with_matching_phrases(["what day is it"])
            .with_action(|_: &Parameters, intent: &Intent| {
                intent.set_parameter("date", Local::now().format("%A, %B %-d, %Y").to_string());
            }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_intents_are_present() {
        let registry = IntentRegistry::new();
        assert_eq!(registry.intent_names(), vec!["date", "ping", "time"]);

        let time = registry.get_intent("time").unwrap();
        time.execute().unwrap();
        let response = time.response_string();
        assert!(response.starts_with("The current time is "));
        assert!(!response.contains("${time}"));
    }

    #[test]
    fn duplicate_and_empty_names_are_rejected() {
        let registry = IntentRegistry::empty();
        assert!(registry.register_intent(Arc::new(Intent::new("lights_on"))));
        assert!(!registry.register_intent(Arc::new(Intent::new("lights_on"))));
        assert!(!registry.register_intent(Arc::new(Intent::new("  "))));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister_intent("lights_on"));
        assert!(!registry.unregister_intent("lights_on"));
        assert!(registry.is_empty());
    }
}
