//! Bounded per-destination memory of recently sent messages.
//!
//! Each destination keeps the last `window` messages (across runs). The
//! number of destinations is capped; the least recently touched one is
//! evicted first. Reassurance allowance is tracked per run, for at most
//! `max_destinations` runs at a time.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::operation::normalize_text;

#[derive(Debug, Clone)]
struct SentMessage {
    run: String,
    step: u32,
    normalized: String,
}

#[derive(Debug, Default)]
struct DestinationHistory {
    messages: VecDeque<SentMessage>,
    touched: u64,
}

pub struct MessageDedupCache {
    window: usize,
    max_destinations: usize,
    /// Normalized, longest first so overlapping phrases strip cleanly.
    filler: Vec<String>,
    destinations: HashMap<String, DestinationHistory>,
    /// Runs that spent their allowance, oldest first.
    reassurance_used: VecDeque<String>,
    tick: u64,
}

impl MessageDedupCache {
    pub fn new(window: usize, max_destinations: usize, filler_phrases: &[String]) -> Self {
        let mut filler: Vec<String> = filler_phrases
            .iter()
            .map(|p| normalize_text(p))
            .filter(|p| !p.is_empty())
            .collect();
        filler.sort_by_key(|p| std::cmp::Reverse(p.len()));
        Self {
            window: window.max(1),
            max_destinations: max_destinations.max(1),
            filler,
            destinations: HashMap::new(),
            reassurance_used: VecDeque::new(),
            tick: 0,
        }
    }

    /// Same normalized text as the last message sent to `destination`.
    pub fn is_exact_duplicate(&self, destination: &str, text: &str) -> bool {
        let normalized = normalize_text(text);
        self.destinations
            .get(destination)
            .and_then(|h| h.messages.back())
            .is_some_and(|last| last.normalized == normalized)
    }

    /// Highest similarity against the recent window for `destination`.
    pub fn max_similarity(&self, destination: &str, text: &str) -> f64 {
        let Some(history) = self.destinations.get(destination) else {
            return 0.0;
        };
        let candidate = self.content_words(&normalize_text(text));
        history
            .messages
            .iter()
            .map(|sent| jaccard(&candidate, &self.content_words(&sent.normalized)))
            .fold(0.0, f64::max)
    }

    pub fn is_similar(&self, destination: &str, text: &str, threshold: f64) -> bool {
        self.max_similarity(destination, text) >= threshold
    }

    /// Step of the latest message `run` sent to `destination`.
    pub fn last_step_for(&self, destination: &str, run: &str) -> Option<u32> {
        self.destinations
            .get(destination)?
            .messages
            .iter()
            .rev()
            .find(|m| m.run == run)
            .map(|m| m.step)
    }

    pub fn record(&mut self, destination: &str, run: &str, step: u32, text: &str) {
        self.tick += 1;
        if !self.destinations.contains_key(destination) {
            self.evict_if_full();
        }
        let history = self.destinations.entry(destination.to_string()).or_default();
        history.touched = self.tick;
        history.messages.push_back(SentMessage {
            run: run.to_string(),
            step,
            normalized: normalize_text(text),
        });
        while history.messages.len() > self.window {
            history.messages.pop_front();
        }
    }

    /// Consume the run's single reassurance allowance. False once spent.
    ///
    /// Only the most recent runs are remembered; the oldest is forgotten
    /// once more than `max_destinations` runs have spent theirs.
    pub fn try_use_reassurance(&mut self, run: &str) -> bool {
        if self.reassurance_used.iter().any(|r| r == run) {
            return false;
        }
        self.reassurance_used.push_back(run.to_string());
        while self.reassurance_used.len() > self.max_destinations {
            self.reassurance_used.pop_front();
        }
        true
    }

    /// Drop per-run state once a run has finished.
    pub fn evict_run(&mut self, run: &str) {
        self.reassurance_used.retain(|r| r != run);
    }

    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    fn evict_if_full(&mut self) {
        while self.destinations.len() >= self.max_destinations {
            let Some(oldest) = self
                .destinations
                .iter()
                .min_by_key(|(_, h)| h.touched)
                .map(|(k, _)| k.clone())
            else {
                return;
            };
            tracing::debug!("🧹 Evicting message history for {oldest}");
            self.destinations.remove(&oldest);
        }
    }

    /// Words left after removing filler phrases.
    fn content_words(&self, normalized: &str) -> BTreeSet<String> {
        let mut padded = format!(" {normalized} ");
        for phrase in &self.filler {
            let needle = format!(" {phrase} ");
            while padded.contains(&needle) {
                padded = padded.replace(&needle, " ");
            }
        }
        padded.split_whitespace().map(str::to_string).collect()
    }
}

/// Jaccard index of two word sets. Two empty sets count as identical.
fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let total = a.union(b).count();
    shared as f64 / total as f64
}
