//! Flow Orchestration Layer
//!
//! Sequencing of named browser steps on top of the CDP adapter: condition-based waiting with
//! tiered timeouts, recovery continuations, bounded retries and failure diagnostics.

pub mod diagnostics;
pub mod errors;
pub mod executor;
pub mod page;
pub mod step;
pub mod strategies;
pub mod types;
pub mod waiter;

pub use diagnostics::DiagnosticCapture;
pub use errors::{FlowError, Retryable};
pub use executor::StepSequencer;
pub use page::PageHandle;
pub use step::{action, NoopAction, Step, StepAction};
pub use strategies::with_retries;
pub use types::{FlowResult, Outcome, StepReport, StepStatus};
pub use waiter::{ConditionWaiter, TimeoutTier, TimeoutTiers, WaitCondition};
