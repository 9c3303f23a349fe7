//! Sheet Autopilot
//!
//! Signs in to the hosted office suite, opens a spreadsheet, triggers a remote action through
//! its UI and waits for the notification that reports the action finished. A second task reads
//! the cloud project link of the spreadsheet's script project.

pub mod authorization;
pub mod completion;
pub mod config;
pub mod orchestrator;
pub mod targets;

pub use authorization::{AuthorizationBranch, BranchOutcome};
pub use completion::{Completion, CompletionObserver, Notification, NotificationFeed};
pub use config::{ConfigError, Task, TaskConfig, TaskKind};
pub use orchestrator::TaskOrchestrator;
