mod queue;
mod trigger;

pub use queue::{NewQuizResult, ResultQueue};
pub use trigger::{SubmitOutcome, SyncTrigger};
