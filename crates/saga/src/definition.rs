//! Declarative saga descriptions.

use std::fmt;
use std::sync::Arc;

use crate::participant::BranchOperation;

type OperationBuilder<I> = Arc<dyn Fn(&I) -> BranchOperation + Send + Sync>;

/// One step of a saga: which participant to call and with what.
pub struct SagaStep<I> {
    name: String,
    participant: String,
    operation: OperationBuilder<I>,
    compensation: String,
}

impl<I> SagaStep<I> {
    /// Creates a step calling `participant` with the operation built from the saga input.
    pub fn new<F>(name: impl Into<String>, participant: impl Into<String>, operation: F) -> Self
    where
        F: Fn(&I) -> BranchOperation + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            compensation: format!("roll back {name}"),
            name,
            participant: participant.into(),
            operation: Arc::new(operation),
        }
    }

    /// Describes how the step is undone.
    pub fn compensated_by(mut self, description: impl Into<String>) -> Self {
        self.compensation = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn compensation(&self) -> &str {
        &self.compensation
    }

    /// Builds the branch operation for `input`.
    pub fn operation(&self, input: &I) -> BranchOperation {
        (self.operation)(input)
    }
}

impl<I> Clone for SagaStep<I> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            participant: self.participant.clone(),
            operation: Arc::clone(&self.operation),
            compensation: self.compensation.clone(),
        }
    }
}

impl<I> fmt::Debug for SagaStep<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("participant", &self.participant)
            .field("compensation", &self.compensation)
            .finish_non_exhaustive()
    }
}

/// A step as it appears in a rollback plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationStep {
    pub step: String,
    pub participant: String,
    pub description: String,
}

/// An ordered list of steps run as one global transaction.
///
/// Steps run in declaration order; compensation runs in reverse.
#[derive(Debug, Clone)]
pub struct SagaDefinition<I> {
    name: String,
    steps: Vec<SagaStep<I>>,
}

impl<I> SagaDefinition<I> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: SagaStep<I>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[SagaStep<I>] {
        &self.steps
    }

    /// The order in which applied steps are undone.
    pub fn compensation_plan(&self) -> Vec<CompensationStep> {
        self.steps
            .iter()
            .rev()
            .map(|step| CompensationStep {
                step: step.name.clone(),
                participant: step.participant.clone(),
                description: step.compensation.clone(),
            })
            .collect()
    }
}
