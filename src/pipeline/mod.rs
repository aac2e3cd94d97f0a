//! Ordered request pipeline.
//!
//! A [`Pipeline`] is an immutable list of [`Step`]s run one after another for
//! each request. Each step returns a [`StepOutcome`]:
//!
//! - `Continue` - run the next step (or the handler after the last one)
//! - `Respond` - the step produced the response; later steps are skipped
//! - `Error` - abort the chain; the error is rendered by the central handler
//!
//! Every step is bounded by a wall-clock timeout. A step that exceeds it is
//! cancelled (its future is dropped, which also abandons any store call in
//! flight) and the pipeline moves on to the next step. Steps that grant
//! access ([`Step::fail_closed`]) are the exception: their timeout ends the
//! request with 503.
//!
//! ```text
//! ctx ─► [cors] ─► [headers] ─► [csrf] ─► [auth] ─► [limit] ─► [authorize] ─► handler
//!           │          │           │         │          │            │
//!           └──────────┴───────────┴─────────┴──────────┴────────────┴─► Respond / Error
//! ```

mod context;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metrics;

pub use context::RequestContext;

/// What a step decided.
#[derive(Debug)]
pub enum StepOutcome {
    Continue,
    Respond {
        status: StatusCode,
        body: Option<Value>,
    },
    Error(AppError),
}

impl StepOutcome {
    pub fn respond(status: StatusCode) -> Self {
        StepOutcome::Respond { status, body: None }
    }
}

impl From<AppError> for StepOutcome {
    fn from(err: AppError) -> Self {
        StepOutcome::Error(err)
    }
}

/// One stage of request processing.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Whether a timeout refuses the request instead of skipping the step.
    fn fail_closed(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut RequestContext) -> StepOutcome;
}

/// Immutable, cheaply cloneable chain of steps.
#[derive(Clone)]
pub struct Pipeline {
    steps: Arc<[Arc<dyn Step>]>,
    step_timeout: Duration,
}

impl Pipeline {
    pub fn builder(step_timeout: Duration) -> PipelineBuilder {
        PipelineBuilder {
            steps: Vec::new(),
            step_timeout,
        }
    }

    /// Names of all steps in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run the steps in order.
    ///
    /// Returns `Continue` when every step let the request through (or timed
    /// out without failing closed), otherwise the first `Respond` or `Error`.
    pub async fn execute(&self, ctx: &mut RequestContext) -> StepOutcome {
        for step in self.steps.iter() {
            let name = step.name();
            match tokio::time::timeout(self.step_timeout, step.run(ctx)).await {
                Ok(StepOutcome::Continue) => {}
                Ok(outcome @ StepOutcome::Respond { .. }) => {
                    debug!(step = name, "Pipeline step completed the response");
                    return outcome;
                }
                Ok(outcome @ StepOutcome::Error(_)) => return outcome,
                Err(_) if step.fail_closed() => {
                    warn!(
                        step = name,
                        timeout_ms = self.step_timeout.as_millis() as u64,
                        path = %ctx.path,
                        "Pipeline step timed out, refusing request"
                    );
                    metrics::record_step_timeout(name);
                    return AppError::ServiceUnavailable(format!("{name} timed out")).into();
                }
                Err(_) => {
                    warn!(
                        step = name,
                        timeout_ms = self.step_timeout.as_millis() as u64,
                        path = %ctx.path,
                        "Pipeline step timed out, continuing"
                    );
                    metrics::record_step_timeout(name);
                }
            }
        }
        StepOutcome::Continue
    }
}

pub struct PipelineBuilder {
    steps: Vec<Arc<dyn Step>>,
    step_timeout: Duration,
}

impl PipelineBuilder {
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            steps: self.steps.into(),
            step_timeout: self.step_timeout,
        }
    }
}
