mod plan;
mod update;

pub use plan::{plan_update, PlanOptions, UpdatePlan};
pub use update::{ResolvedArtifact, StageOutcome, UpdateOutcome, Updater};

#[cfg(test)]
mod tests;
