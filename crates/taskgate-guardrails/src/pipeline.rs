//! The guardrail pipeline: ordered checks over one proposed batch.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use taskgate_core::config::GuardrailConfig;
use taskgate_core::error::Result;

use crate::context::RunContext;
use crate::dedup::MessageDedupCache;
use crate::operation::{Intent, ProposedOperation, ToolKind, normalize_target, normalize_text};
use crate::router::Router;

/// Longest text still treated as a reassurance phrase, in words.
const REASSURANCE_MAX_WORDS: usize = 8;

/// Why an operation was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    StepBudget,
    UnknownTool,
    RoutingAvoided,
    RoutingNotPreferred,
    DuplicateSignature,
    QueryLoop,
    NavigationLoop,
    PhaseLoop,
    OrchestrationLoop,
    ArtifactReuse,
    MessageBudget,
    DuplicateMessage,
    SimilarMessage,
}

/// One suppression, for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Operation name. `None` for run-level decisions.
    pub operation: Option<String>,
    pub reason: SuppressionReason,
    pub detail: String,
}

/// What the caller should do with the run after this batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Execute the surviving operations and deliver `redeliver`.
    Proceed,
    /// Step budget exceeded. Treat the goal as satisfied and stop.
    ForcedComplete,
    /// Only repeat messages were dropped and something was already sent.
    AlreadyDelivered,
    /// Everything was dropped for other reasons.
    AllSuppressed,
}

impl Verdict {
    /// The run should stop iterating.
    pub fn is_terminal(self) -> bool {
        matches!(self, Verdict::ForcedComplete | Verdict::AlreadyDelivered)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailOutcome {
    pub operations: Vec<ProposedOperation>,
    pub diagnostics: Vec<Diagnostic>,
    pub verdict: Verdict,
    /// Existing artifacts to deliver instead of regenerating.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redeliver: Vec<String>,
}

/// Batch under evaluation: survivors with their kind, plus what was dropped.
struct Batch {
    ops: Vec<(ProposedOperation, ToolKind)>,
    dropped: Vec<ToolKind>,
    diagnostics: Vec<Diagnostic>,
}

impl Batch {
    fn suppress(&mut self, op: &ProposedOperation, kind: ToolKind, reason: SuppressionReason, detail: String) {
        tracing::debug!("🛡️ Suppressed {} ({:?}): {}", op.name, reason, detail);
        self.dropped.push(kind);
        self.diagnostics.push(Diagnostic {
            operation: Some(op.name.clone()),
            reason,
            detail,
        });
    }

    /// Run `check` over every survivor in order, dropping those it rejects.
    fn retain<F>(&mut self, mut check: F)
    where
        F: FnMut(&ProposedOperation, ToolKind) -> Option<(SuppressionReason, String)>,
    {
        for (op, kind) in std::mem::take(&mut self.ops) {
            match check(&op, kind) {
                Some((reason, detail)) => self.suppress(&op, kind, reason, detail),
                None => self.ops.push((op, kind)),
            }
        }
    }
}

/// Filters proposed batches. One instance is shared by every run in the
/// process; the only state it keeps is the message history cache.
pub struct GuardrailPipeline {
    config: GuardrailConfig,
    router: Router,
    reassurance: Vec<String>,
    cache: Mutex<MessageDedupCache>,
}

impl GuardrailPipeline {
    pub fn new(config: &GuardrailConfig) -> Result<Self> {
        let router = Router::compile(&config.routing_rules)?;
        let cache = MessageDedupCache::new(
            config.message_dedup_window,
            config.max_destinations,
            &config.filler_phrases,
        );
        tracing::info!("🛡️ Guardrail pipeline ready ({} routing rules)", router.len());
        Ok(Self {
            config: config.clone(),
            router,
            reassurance: config
                .reassurance_phrases
                .iter()
                .map(|p| normalize_text(p))
                .filter(|p| !p.is_empty())
                .collect(),
            cache: Mutex::new(cache),
        })
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Evaluate one proposed batch against the run context.
    pub fn evaluate(&self, proposed: Vec<ProposedOperation>, ctx: &RunContext) -> GuardrailOutcome {
        let proposed_count = proposed.len();

        // 1. Step budget
        let mut max_steps = ctx.step_budget.unwrap_or(self.config.max_steps_per_action);
        if ctx.interactive {
            max_steps = max_steps.max(self.config.min_user_steps);
        }
        if ctx.step > max_steps {
            tracing::warn!(
                "⛔ Run {} hit step {} of {}, forcing completion",
                ctx.task_id,
                ctx.step,
                max_steps
            );
            let detail = format!("step {} exceeds budget {}", ctx.step, max_steps);
            let mut diagnostics: Vec<Diagnostic> = proposed
                .iter()
                .map(|op| Diagnostic {
                    operation: Some(op.name.clone()),
                    reason: SuppressionReason::StepBudget,
                    detail: detail.clone(),
                })
                .collect();
            if diagnostics.is_empty() {
                diagnostics.push(Diagnostic {
                    operation: None,
                    reason: SuppressionReason::StepBudget,
                    detail,
                });
            }
            return GuardrailOutcome {
                operations: Vec::new(),
                diagnostics,
                verdict: Verdict::ForcedComplete,
                redeliver: Vec::new(),
            };
        }

        let mut batch = Batch {
            ops: Vec::with_capacity(proposed_count),
            dropped: Vec::new(),
            diagnostics: Vec::new(),
        };

        // 2. Unknown tools
        for op in proposed {
            match ctx.kind_of(&op.name) {
                Some(kind) => batch.ops.push((op, kind)),
                None => {
                    let detail = format!("'{}' is not in the allow-list", op.name);
                    batch.suppress(&op, ToolKind::Other, SuppressionReason::UnknownTool, detail);
                }
            }
        }

        // 3. Routing rules
        for rule in self.router.matching(&ctx.task_description) {
            batch.retain(|op, _| {
                rule.rejects(&op.name)
                    .map(|reason| (reason, format!("routing rule /{}/", rule.pattern())))
            });
        }

        // 4. Identical operations within the batch
        let mut signatures = HashSet::new();
        batch.retain(|op, _| {
            (!signatures.insert(op.signature()))
                .then(|| (SuppressionReason::DuplicateSignature, "identical operation in batch".to_string()))
        });

        self.suppress_loops(&mut batch, ctx);

        // 8. Artifacts already produced this run
        let mut redeliver = Vec::new();
        let artifacts: HashMap<String, String> = ctx
            .past()
            .filter_map(|(inv, _, intent)| match (intent, &inv.artifact) {
                (Intent::Generate { prompt }, Some(artifact)) => {
                    Some((artifact_key(&inv.name, &prompt), artifact.clone()))
                }
                _ => None,
            })
            .collect();
        batch.retain(|op, kind| {
            let Intent::Generate { prompt } = op.intent(kind) else {
                return None;
            };
            let artifact = artifacts.get(&artifact_key(&op.name, &prompt))?;
            if !redeliver.contains(artifact) {
                redeliver.push(artifact.clone());
            }
            Some((SuppressionReason::ArtifactReuse, format!("already produced {artifact}")))
        });

        // 9. Outbound messages
        self.govern_messages(&mut batch, ctx);

        // 10. Fallback
        let verdict = if proposed_count > 0 && batch.ops.is_empty() {
            let only_messages = batch.dropped.iter().all(|k| *k == ToolKind::Message);
            if !redeliver.is_empty() {
                tracing::info!("♻️ Run {}: re-delivering {} artifacts", ctx.task_id, redeliver.len());
                Verdict::Proceed
            } else if only_messages && ctx.messages_sent > 0 {
                tracing::info!("✅ Run {} already delivered its reply", ctx.task_id);
                Verdict::AlreadyDelivered
            } else {
                tracing::info!("🚫 Run {}: all {} operations suppressed", ctx.task_id, proposed_count);
                Verdict::AllSuppressed
            }
        } else {
            Verdict::Proceed
        };

        GuardrailOutcome {
            operations: batch.ops.into_iter().map(|(op, _)| op).collect(),
            diagnostics: batch.diagnostics,
            verdict,
            redeliver,
        }
    }

    /// Checks 5 to 7: repeated searches, navigation and orchestration calls.
    fn suppress_loops(&self, batch: &mut Batch, ctx: &RunContext) {
        let limit = self.config.max_tool_loops;
        let mut queries: HashMap<String, u32> = HashMap::new();
        let mut targets: HashMap<String, u32> = HashMap::new();
        let mut orchestration: HashMap<String, u32> = HashMap::new();
        for (inv, kind, intent) in ctx.past() {
            match intent {
                Intent::Search { query } => *queries.entry(normalize_text(&query)).or_default() += 1,
                Intent::Navigate { target } => *targets.entry(normalize_target(&target)).or_default() += 1,
                _ if kind == ToolKind::Orchestration => {
                    *orchestration.entry(inv.name.clone()).or_default() += 1
                }
                _ => {}
            }
        }

        batch.retain(|op, kind| {
            let Intent::Search { query } = op.intent(kind) else {
                return None;
            };
            let count = queries.entry(normalize_text(&query)).or_default();
            if *count >= limit {
                return Some((SuppressionReason::QueryLoop, format!("query '{query}' tried {count} times")));
            }
            *count += 1;
            None
        });

        let phases: HashSet<ToolKind> = ctx
            .since_last_message()
            .iter()
            .filter_map(|inv| ctx.kind_of(&inv.name))
            .collect();
        let explored = [ToolKind::Navigate, ToolKind::Inspect, ToolKind::Extract]
            .iter()
            .all(|k| phases.contains(k));
        batch.retain(|op, kind| {
            let Intent::Navigate { target } = op.intent(kind) else {
                return None;
            };
            if explored {
                return Some((
                    SuppressionReason::PhaseLoop,
                    "already navigated, inspected and extracted without replying".to_string(),
                ));
            }
            let count = targets.entry(normalize_target(&target)).or_default();
            if *count >= limit {
                return Some((SuppressionReason::NavigationLoop, format!("'{target}' visited {count} times")));
            }
            *count += 1;
            None
        });

        batch.retain(|op, kind| {
            if kind != ToolKind::Orchestration {
                return None;
            }
            let count = orchestration.entry(op.name.clone()).or_default();
            if *count >= limit {
                return Some((SuppressionReason::OrchestrationLoop, format!("already ran {count} times")));
            }
            *count += 1;
            None
        });
    }

    fn govern_messages(&self, batch: &mut Batch, ctx: &RunContext) {
        let budget = ctx
            .message_budget
            .unwrap_or(self.config.max_messages_per_action)
            .max(1);
        let threshold = self.config.message_similarity_threshold;
        let run = ctx.task_id.as_str();
        let mut sent = ctx.messages_sent;
        let mut cache = self.lock_cache();

        batch.retain(|op, kind| {
            let Intent::Message { recipient, text } = op.intent(kind) else {
                return None;
            };
            let recipient = recipient
                .or_else(|| ctx.destination.clone())
                .or_else(|| ctx.channel.clone())
                .unwrap_or_else(|| "default".to_string());
            let destination = format!("{}:{}", op.name, recipient);

            if sent >= budget {
                return Some((SuppressionReason::MessageBudget, format!("{sent} of {budget} messages sent")));
            }

            // The first message of a run always goes out.
            if sent > 0 {
                let duplicate = if cache.is_exact_duplicate(&destination, &text) {
                    Some(SuppressionReason::DuplicateMessage)
                } else if cache.is_similar(&destination, &text, threshold) {
                    Some(SuppressionReason::SimilarMessage)
                } else {
                    None
                };
                if let Some(reason) = duplicate {
                    let fresh_output = ctx.has_new_output(cache.last_step_for(&destination, run));
                    let reassurance = !fresh_output
                        && self.is_reassurance(&text)
                        && cache.try_use_reassurance(run);
                    if !fresh_output && !reassurance {
                        return Some((reason, format!("repeats a recent message to {recipient}")));
                    }
                }
            }

            cache.record(&destination, run, ctx.step, &text);
            sent += 1;
            None
        });
    }

    /// Drop per-run state for a finished run.
    ///
    /// Runs that never call this are forgotten once newer runs push them out
    /// of the bounded cache.
    pub fn finish_run(&self, task_id: &str) {
        self.lock_cache().evict_run(task_id);
    }

    fn is_reassurance(&self, text: &str) -> bool {
        let normalized = normalize_text(text);
        if normalized.split_whitespace().count() > REASSURANCE_MAX_WORDS {
            return false;
        }
        let padded = format!(" {normalized} ");
        self.reassurance
            .iter()
            .any(|phrase| padded.contains(&format!(" {phrase} ")))
    }

    fn lock_cache(&self) -> MutexGuard<'_, MessageDedupCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn artifact_key(tool: &str, prompt: &str) -> String {
    format!("{}:{}", tool, normalize_text(prompt))
}
