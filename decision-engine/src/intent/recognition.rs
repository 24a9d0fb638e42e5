//! Local keyword-based intent recognition.
//!
//! A request fans out one scoring job per registered intent across a pool
//! of workers, each with its own queue; a job goes to the worker with the
//! shortest queue. Results are aggregated per request and the callback
//! fires exactly once, with the best match or `None`. Once the aggregation
//! window has elapsed the next report settles the request with whatever has
//! been seen so far.

use super::{Intent, IntentRegistry};
use crate::config::RecognitionConfig;
use crate::error::panic_message;
use crate::queue::TaskQueue;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Weight of a matching phrase relative to a single keyword hit.
const PHRASE_WEIGHT: u32 = 2;

#[derive(Debug, Clone)]
pub struct IntentMatch {
    pub intent: Arc<Intent>,
    pub score: u32,
}

impl IntentMatch {
    fn beats(&self, other: &IntentMatch) -> bool {
        self.score > other.score
            || (self.score == other.score && self.intent.name() < other.intent.name())
    }
}

pub type RecognitionCallback = Box<dyn FnOnce(Option<IntentMatch>) + Send>;

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Counts input tokens equal to one of the intent's parameter names or
/// matching params (case-insensitive). Each matching phrase contained in
/// the input adds [`PHRASE_WEIGHT`].
pub fn score_intent(intent: &Intent, text: &str) -> u32 {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 0;
    }
    let keywords: HashSet<String> = intent
        .parameters()
        .into_keys()
        .chain(intent.matching_params())
        .map(|k| k.to_lowercase())
        .collect();

    let mut score = tokens.iter().filter(|t| keywords.contains(*t)).count() as u32;

    let normalized = format!(" {} ", tokens.join(" "));
    for phrase in intent.matching_phrases() {
        let phrase = tokenize(&phrase).join(" ");
        if !phrase.is_empty() && normalized.contains(&format!(" {} ", phrase)) {
            score += PHRASE_WEIGHT;
        }
    }
    score
}

struct Collector {
    state: Mutex<CollectorState>,
    deadline: Instant,
}

struct CollectorState {
    pending: usize,
    best: Option<IntentMatch>,
    callback: Option<RecognitionCallback>,
}

impl Collector {
    fn new(pending: usize, window: Duration, callback: RecognitionCallback) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                pending,
                best: None,
                callback: Some(callback),
            }),
            deadline: Instant::now() + window,
        }
    }

    fn report(&self, result: Option<IntentMatch>) {
        let settled = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending = state.pending.saturating_sub(1);
            if let Some(candidate) = result {
                let replace = state
                    .best
                    .as_ref()
                    .map_or(true, |best| candidate.beats(best));
                if replace {
                    state.best = Some(candidate);
                }
            }
            if state.callback.is_some()
                && (state.pending == 0 || Instant::now() >= self.deadline)
            {
                state.callback.take().map(|cb| (cb, state.best.clone()))
            } else {
                None
            }
        };

        if let Some((callback, best)) = settled {
            debug!(
                "[IntentRecognition] Settled with {:?}",
                best.as_ref().map(|m| m.intent.name().to_string())
            );
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(best))) {
                error!(
                    "[IntentRecognition] Recognition callback panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

enum RecognitionJob {
    Match {
        intent_name: String,
        text: Arc<str>,
        collector: Arc<Collector>,
    },
    Shutdown,
}

pub struct LocalIntentRecognition {
    registry: Arc<IntentRegistry>,
    queues: Vec<Arc<TaskQueue<RecognitionJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    window: Duration,
    shut_down: AtomicBool,
}

impl LocalIntentRecognition {
    pub fn new(registry: Arc<IntentRegistry>, config: RecognitionConfig) -> Self {
        let count = config.thread_count();
        let mut queues = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);

        for i in 0..count {
            let queue: Arc<TaskQueue<RecognitionJob>> = Arc::new(TaskQueue::new());
            let worker_queue = queue.clone();
            let worker_registry = registry.clone();
            match thread::Builder::new()
                .name(format!("intent-recognizer-{}", i))
                .spawn(move || recognition_worker(&worker_registry, &worker_queue))
            {
                Ok(handle) => {
                    queues.push(queue);
                    workers.push(handle);
                }
                Err(e) => error!("[IntentRecognition] Failed to spawn worker {}: {}", i, e),
            }
        }
        info!("[IntentRecognition] Started {} recognizer threads", workers.len());

        Self {
            registry,
            queues,
            workers: Mutex::new(workers),
            window: config.aggregation_window(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<IntentRegistry> {
        &self.registry
    }

    /// Scores `text` against one intent. `None` when the intent is unknown
    /// or nothing matched.
    pub fn recognize_intent(&self, name: &str, text: &str) -> Option<IntentMatch> {
        let intent = self.registry.get_intent(name)?;
        let score = score_intent(&intent, text);
        (score > 0).then_some(IntentMatch { intent, score })
    }

    /// Synchronous best match across every registered intent.
    pub fn best_match(&self, text: &str) -> Option<IntentMatch> {
        let mut best: Option<IntentMatch> = None;
        for name in self.registry.intent_names() {
            if let Some(candidate) = self.recognize_intent(&name, text) {
                if best.as_ref().map_or(true, |b| candidate.beats(b)) {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Fans the request out to the worker pool. The callback runs exactly
    /// once on a recognizer thread (or inline when no intents exist).
    /// Returns false when the recognizer has been shut down.
    pub fn recognize_intent_async<F>(&self, text: &str, callback: F) -> bool
    where
        F: FnOnce(Option<IntentMatch>) + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) || self.queues.is_empty() {
            warn!("[IntentRecognition] Recognizer not running; dropping request");
            return false;
        }
        let names = self.registry.intent_names();
        if names.is_empty() {
            callback(None);
            return true;
        }

        let collector = Arc::new(Collector::new(names.len(), self.window, Box::new(callback)));
        let text: Arc<str> = Arc::from(text);
        for intent_name in names {
            let queue = self
                .queues
                .iter()
                .min_by_key(|q| q.len())
                .unwrap_or(&self.queues[0]);
            queue.push(RecognitionJob::Match {
                intent_name,
                text: text.clone(),
                collector: collector.clone(),
            });
        }
        true
    }

    /// Recognizes `text` and executes the winning intent, if any.
    pub fn recognize_and_execute(&self, text: &str) -> bool {
        let input = text.to_string();
        self.recognize_intent_async(text, move |found| match found {
            Some(m) => {
                info!(
                    "[IntentRecognition] '{}' matched '{}' (score {})",
                    input,
                    m.intent.name(),
                    m.score
                );
                if let Err(e) = m.intent.execute() {
                    error!("[IntentRecognition] {}", e);
                }
            }
            None => info!("[IntentRecognition] No intent matched '{}'", input),
        })
    }

    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for queue in &self.queues {
            queue.push(RecognitionJob::Shutdown);
        }
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("[IntentRecognition] Recognizer thread panicked");
            }
        }
        info!("[IntentRecognition] Shut down");
    }
}

impl Drop for LocalIntentRecognition {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn recognition_worker(registry: &IntentRegistry, queue: &TaskQueue<RecognitionJob>) {
    loop {
        match queue.pop() {
            RecognitionJob::Shutdown => break,
            RecognitionJob::Match {
                intent_name,
                text,
                collector,
            } => {
                let result = registry.get_intent(&intent_name).and_then(|intent| {
                    let score = score_intent(&intent, &text);
                    (score > 0).then_some(IntentMatch { intent, score })
                });
                collector.report(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_on_punctuation() {
        assert_eq!(
            tokenize("Turn ON the lights, please!"),
            vec!["turn", "on", "the", "lights", "please"]
        );
        assert!(tokenize("  ?!  ").is_empty());
    }

    #[test]
    fn scoring_counts_parameter_names_and_phrases() {
        let intent = Intent::new("weather")
            .with_parameter("City", "")
            .with_matching_params(["weather", "forecast"])
            .with_matching_phrases(["will it rain"]);

        assert_eq!(score_intent(&intent, "hello there"), 0);
        assert_eq!(score_intent(&intent, "weather in my city"), 2);
        assert_eq!(score_intent(&intent, "Will it rain? Check the forecast"), 3);
    }

    #[test]
    fn phrase_must_align_with_token_boundaries() {
        let intent = Intent::new("x").with_matching_phrases(["rain"]);
        assert_eq!(score_intent(&intent, "terrain"), 0);
        assert_eq!(score_intent(&intent, "rain today"), PHRASE_WEIGHT);
    }

    #[test]
    fn ties_prefer_smaller_name() {
        let a = IntentMatch { intent: Arc::new(Intent::new("alpha")), score: 2 };
        let b = IntentMatch { intent: Arc::new(Intent::new("beta")), score: 2 };
        let c = IntentMatch { intent: Arc::new(Intent::new("gamma")), score: 3 };
        assert!(a.beats(&b));
        assert!(!b.beats(&a));
        assert!(c.beats(&a));
    }
}
