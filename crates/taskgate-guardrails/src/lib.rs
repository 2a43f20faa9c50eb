//! # TaskGate Guardrails
//!
//! Filters a proposed batch of side-effecting operations before it executes.
//!
//! ## Checks (in order)
//! 1. Step budget: past the limit, drop everything and force completion
//! 2. Unknown tools: not in the run's allow-list
//! 3. Routing rules: avoided tools, or only preferred tools
//! 4. Identical operations within the batch
//! 5. Repeated search queries
//! 6. Repeated navigation, or exploring again without replying
//! 7. Repeated status/listing calls
//! 8. Regenerating an artifact that already exists
//! 9. Outbound messages: budget, exact and near duplicates
//! 10. Verdict when nothing survives
//!
//! Suppression is never an error. Every dropped operation gets a
//! [`Diagnostic`] with a reason tag.

pub mod context;
pub mod dedup;
pub mod operation;
pub mod pipeline;
pub mod router;

pub use context::{RunContext, ToolInvocation};
pub use dedup::MessageDedupCache;
pub use operation::{Intent, ProposedOperation, ToolKind};
pub use pipeline::{Diagnostic, GuardrailOutcome, GuardrailPipeline, SuppressionReason, Verdict};
pub use router::{Router, RoutingRule};
