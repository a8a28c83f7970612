//! Bounded stage invocation.
//!
//! Every call runs as its own task. On timeout the task is left detached: it
//! may finish in the background but its result is dropped. Errors, panics and
//! payloads of the wrong shape all come back as a failed [`StageResult`]; the
//! executor never retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Stage, StageContext, input_ref};
use crate::model::{StageError, StageErrorKind, StageInput, StageKind, StageResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct StageExecutor;

impl StageExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn invoke(
        &self,
        kind: StageKind,
        stage: Arc<dyn Stage>,
        ctx: &StageContext,
        input: StageInput,
        limit: Duration,
    ) -> StageResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let reference = input_ref(&input);

        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { stage.run(&task_ctx, input).await });

        let outcome = timeout(limit, handle).await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        let mut result = StageResult {
            stage: kind,
            attempt: ctx.attempt,
            input_ref: reference,
            success: false,
            payload: None,
            error: None,
            started_at,
            duration_ms,
        };

        let failure = match outcome {
            Err(_) => {
                warn!(
                    run_id = %ctx.run_id,
                    stage = %kind,
                    attempt = ctx.attempt,
                    timeout_secs = limit.as_secs_f64(),
                    "stage timed out"
                );
                StageError {
                    kind: StageErrorKind::StageTimeout,
                    message: format!("{} stage timed out after {:?}", kind, limit),
                }
            }
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                warn!(run_id = %ctx.run_id, stage = %kind, "stage task aborted: {message}");
                StageError {
                    kind: StageErrorKind::StageFailure,
                    message: format!("{} stage panicked: {}", kind, message),
                }
            }
            Ok(Ok(Err(err))) => {
                warn!(run_id = %ctx.run_id, stage = %kind, "stage failed: {err:#}");
                StageError {
                    kind: StageErrorKind::StageFailure,
                    message: format!("{:#}", err),
                }
            }
            Ok(Ok(Ok(payload))) if payload.stage() != kind => StageError {
                kind: StageErrorKind::StageFailure,
                message: format!(
                    "{} stage returned a payload for the {} stage",
                    kind,
                    payload.stage()
                ),
            },
            Ok(Ok(Ok(payload))) => {
                debug!(
                    run_id = %ctx.run_id,
                    stage = %kind,
                    attempt = ctx.attempt,
                    duration_ms,
                    "stage succeeded"
                );
                result.success = true;
                result.payload = Some(payload);
                return result;
            }
        };

        result.error = Some(failure);
        result
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
