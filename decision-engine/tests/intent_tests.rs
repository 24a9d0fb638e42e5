use decision_engine::config::RecognitionConfig;
use decision_engine::intent::{
    EmotionRange, EmotionScorer, Intent, IntentRegistry, IntentType, LocalIntentRecognition,
    Parameters,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn recognizer(registry: Arc<IntentRegistry>) -> LocalIntentRecognition {
    LocalIntentRecognition::new(
        registry,
        RecognitionConfig {
            threads: 3,
            aggregation_window_ms: 250,
        },
    )
}

fn home_registry() -> Arc<IntentRegistry> {
    let registry = Arc::new(IntentRegistry::empty());
    registry.register_intent(Arc::new(
        Intent::new("lights_on")
            .with_parameter("room", "")
            .with_matching_params(["lights", "lamp"])
            .with_matching_phrases(["turn on the lights"]),
    ));
    registry.register_intent(Arc::new(
        Intent::new("weather")
            .with_type(IntentType::Question)
            .with_matching_params(["weather", "rain", "forecast"]),
    ));
    registry.register_intent(Arc::new(
        Intent::new("music").with_matching_params(["play", "music", "song"]),
    ));
    registry
}

#[test]
fn async_recognition_picks_the_best_match_exactly_once() {
    let recognizer = recognizer(home_registry());
    let (tx, rx) = mpsc::channel();
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();

    assert!(recognizer.recognize_intent_async(
        "please turn on the lights in the kitchen",
        move |found| {
            seen.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(found.map(|m| (m.intent.name().to_string(), m.score)));
        },
    ));

    let (name, score) = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(name, "lights_on");
    assert_eq!(score, 3);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn no_match_reports_none() {
    let recognizer = recognizer(home_registry());
    let (tx, rx) = mpsc::channel();
    recognizer.recognize_intent_async("what is the meaning of life", move |found| {
        let _ = tx.send(found.is_none());
    });
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn empty_registry_answers_inline() {
    let recognizer = recognizer(Arc::new(IntentRegistry::empty()));
    let (tx, rx) = mpsc::channel();
    assert!(recognizer.recognize_intent_async("anything", move |found| {
        let _ = tx.send(found.is_none());
    }));
    assert!(rx.try_recv().unwrap());
}

#[test]
fn shutdown_rejects_new_requests() {
    let recognizer = recognizer(home_registry());
    recognizer.shutdown();
    assert!(!recognizer.recognize_intent_async("play music", |_| {}));
    assert!(!recognizer.recognize_and_execute("play music"));
}

#[test]
fn recognize_and_execute_runs_the_winner() {
    let registry = Arc::new(IntentRegistry::empty());
    let count = Arc::new(AtomicU32::new(0));
    let seen = count.clone();
    registry.register_intent(Arc::new(
        Intent::new("music")
            .with_matching_params(["music"])
            .with_action(move |_: &Parameters, _: &Intent| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
    ));
    let recognizer = recognizer(registry);
    assert!(recognizer.recognize_and_execute("some music please"));
    for _ in 0..100 {
        if count.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn system_time_intent_is_recognized_and_answers() {
    let recognizer = recognizer(Arc::new(IntentRegistry::new()));
    let found = recognizer.best_match("hey, what time is it?").unwrap();
    assert_eq!(found.intent.name(), "time");
    found.intent.execute().unwrap();
    assert!(found
        .intent
        .response_string()
        .starts_with("The current time is "));
}

struct FixedScorer(f32);

impl EmotionScorer for FixedScorer {
    fn match_score(&self, _ranges: &[EmotionRange]) -> f32 {
        self.0
    }
}

#[test]
fn scored_responses_follow_the_scorer() {
    let intent = Intent::new("greet")
        .with_parameter("name", "Sam")
        .with_response_string("Hello ${name}");
    intent.set_scored_response_strings(vec![
        "Hey ${name}".to_string(),
        "Hi ${name}".to_string(),
        "Good day ${name}".to_string(),
    ]);

    assert_eq!(intent.response_string_scored(&FixedScorer(0.0)), "Hey Sam");
    assert_eq!(intent.response_string_scored(&FixedScorer(50.0)), "Good day Sam");
    // Index 5 is past the three variants, so the base template is used.
    assert_eq!(intent.response_string_scored(&FixedScorer(99.0)), "Hello Sam");
}
