//! The approval workflow engine.
//!
//! A flow instance walks the nodes of the template it was started from, in
//! ascending `sort_key` order. Each node is materialized as a node case with
//! one vote per approver; once the node resolves, the dispatcher either opens
//! the next node or finalizes the instance and runs the completion handler
//! registered for its category.

pub mod completion;
pub mod dispatcher;
pub mod evaluator;
pub mod instance;

pub use completion::{CompletionHandler, CompletionRegistry, RefundCompletion};
pub use evaluator::{evaluate_node, VoteOutcome};
