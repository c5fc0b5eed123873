//! Credit reservation and settlement.
//!
//! A submission is charged up front and committed as a `Pending` generation
//! together with its debit. The provider is then called, either inline or by
//! a worker, and the outcome is folded back into the generation: success
//! keeps the debit, any failure refunds it exactly once. Provider errors
//! never reach the buyer as errors; they surface as a `Failed` generation
//! with a `fail_reason`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use avatarbank_core::{
    verify_ledger, AvatarId, GeneratedImage, Generation, GenerationId, GenerationStatus,
    MarketError, PricingConfig, Result, Task, TaskId, TaskStatus, Transition, UserId,
};
use avatarbank_store::{Reservation, Store, TransitionOutcome};

use crate::config::{GenerationMode, ServiceConfig};
use crate::dispatch::{TaskDispatcher, TaskMessage};
use crate::provider::{ImageProvider, PollStatus, ProviderError};

/// Most stale generations settled per sweep.
const SWEEP_BATCH: usize = 100;

/// A generation request from a buyer.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Avatar to render against, if any.
    pub avatar_id: Option<AvatarId>,
    /// Prompt text.
    pub prompt: String,
    /// Extra credits for paid options.
    pub option_credits: i64,
    /// Makes the request safe to repeat.
    pub idempotency_key: Option<String>,
}

/// Result of [`Settlement::submit`].
#[derive(Debug, Clone)]
pub struct Submission {
    /// The generation as it stands when the call returns.
    pub generation: Generation,
    /// Task created for the queued path.
    pub task: Option<Task>,
    /// Whether the idempotency key matched an earlier submission.
    pub replayed: bool,
}

/// Result of [`Settlement::fail_task`].
#[derive(Debug, Clone)]
pub enum TaskFailure {
    /// The generation was put back in the queue under a new task.
    Retried {
        /// The generation, back in `Pending`.
        generation: Generation,
        /// The replacement task.
        task: Task,
    },
    /// The generation was settled.
    Settled(TransitionOutcome),
    /// The task had already finished. Nothing was written; the generation is
    /// returned as it stands.
    Ignored(Generation),
}

/// Summary of a stale sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Generations examined.
    pub examined: usize,
    /// Generations failed and refunded.
    pub refunded: Vec<GenerationId>,
    /// Generations that settled concurrently and were left alone.
    pub already_settled: usize,
}

/// Ledger replay result for one user.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerAudit {
    /// Audited user.
    pub user_id: UserId,
    /// Cached balance on the user record.
    pub cached_balance: i64,
    /// Balance reproduced from the ledger, when replay succeeded.
    pub replayed_balance: Option<i64>,
    /// Number of ledger entries.
    pub entries: usize,
    /// Whether the ledger and the cached balance agree.
    pub consistent: bool,
    /// First violation found, if any.
    pub violation: Option<String>,
}

/// Runs the generation protocol.
pub struct Settlement {
    store: Arc<dyn Store>,
    provider: Arc<dyn ImageProvider>,
    dispatcher: Arc<dyn TaskDispatcher>,
    pricing: PricingConfig,
    mode: GenerationMode,
    provider_timeout_seconds: u64,
    poll_interval: Duration,
    max_task_retries: u32,
    stale_after: chrono::Duration,
}

impl Settlement {
    /// Wire the protocol to its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ImageProvider>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            provider,
            dispatcher,
            pricing: config.pricing.clone(),
            mode: config.generation_mode,
            provider_timeout_seconds: config.provider.timeout_seconds,
            poll_interval: Duration::from_millis(config.provider.poll_interval_ms),
            max_task_retries: config.max_task_retries,
            stale_after: chrono::Duration::seconds(
                i64::try_from(config.stale_after_seconds).unwrap_or(i64::MAX / 1000),
            ),
        }
    }

    /// Which path new submissions take.
    #[must_use]
    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Charge the buyer, record the generation, and dispatch it.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` / `InvalidAmount` for a bad prompt or option credits.
    /// - `UserNotFound` if the buyer has no profile.
    /// - `AvatarNotFound` if the avatar is missing or not public.
    /// - `InsufficientCredits` if the buyer cannot pay. Nothing is written.
    /// - `ConcurrencyConflict` if the debit lost a database race.
    ///
    /// Provider failures are not errors: they return a `Failed` generation.
    pub async fn submit(
        self: &Arc<Self>,
        buyer_id: &UserId,
        request: SubmitRequest,
    ) -> Result<Submission> {
        avatarbank_core::validate_prompt(&request.prompt)?;

        self.store
            .get_user(buyer_id)
            .await?
            .ok_or_else(|| MarketError::UserNotFound {
                user_id: buyer_id.to_string(),
            })?;

        let avatar = match request.avatar_id {
            Some(avatar_id) => {
                let avatar = self
                    .store
                    .get_avatar(&avatar_id)
                    .await?
                    .filter(avatarbank_core::Avatar::is_available)
                    .ok_or_else(|| MarketError::AvatarNotFound {
                        avatar_id: avatar_id.to_string(),
                    })?;
                Some(avatar)
            }
            None => None,
        };

        let cost = self
            .pricing
            .total_cost(avatar.as_ref(), request.option_credits)?;

        let pending = Generation::pending(
            *buyer_id,
            request.avatar_id,
            request.prompt,
            cost,
            request.idempotency_key,
        );

        let generation = match self.store.reserve_generation(&pending).await? {
            Reservation::Existing(generation) => {
                tracing::info!(
                    user_id = %buyer_id,
                    generation_id = %generation.id,
                    "Idempotent replay of generation"
                );
                return Ok(Submission {
                    generation,
                    task: None,
                    replayed: true,
                });
            }
            Reservation::Created { generation, debit } => {
                tracing::info!(
                    user_id = %buyer_id,
                    generation_id = %generation.id,
                    credits = cost,
                    balance_after = debit.credit_after,
                    "Generation charged"
                );
                generation
            }
        };

        // Past the debit the request may be dropped at any await (client
        // disconnect, request timeout). The rest runs detached so the charge
        // is always settled.
        let this = Arc::clone(self);
        let generation_id = generation.id;
        tokio::spawn(async move { this.dispatch_reserved(generation).await })
            .await
            .map_err(|e| {
                tracing::error!(generation_id = %generation_id, error = %e, "Dispatch task aborted");
                MarketError::Storage(format!("dispatch of generation {generation_id} aborted: {e}"))
            })?
    }

    /// Run or enqueue a freshly charged generation.
    async fn dispatch_reserved(&self, generation: Generation) -> Result<Submission> {
        match self.mode {
            GenerationMode::Sync => {
                let generation = self.run_inline(generation).await?;
                Ok(Submission {
                    generation,
                    task: None,
                    replayed: false,
                })
            }
            GenerationMode::Async => {
                let (generation, task) = self.enqueue(generation, 0).await?;
                Ok(Submission {
                    generation,
                    task: Some(task),
                    replayed: false,
                })
            }
        }
    }

    /// Call the provider and settle the outcome.
    ///
    /// A generation that cannot be started is failed and refunded, or
    /// returned as it stands if something else already settled it.
    async fn run_inline(&self, generation: Generation) -> Result<Generation> {
        let id = generation.id;
        match self.store.apply_transition(&id, Transition::Start).await {
            Ok(TransitionOutcome::Applied { .. }) => {}
            Ok(TransitionOutcome::AlreadySettled(current)) => return Ok(current),
            Err(e) => {
                let err = MarketError::from(e);
                tracing::warn!(generation_id = %id, error = %err, "Could not start generation");
                if matches!(err, MarketError::InvalidTransition { .. }) {
                    return self.load_generation(&id).await;
                }
                return Ok(self.settle(&id, Err(err)).await?.into_generation());
            }
        }

        let seconds = self.provider_timeout_seconds;
        let result = tokio::time::timeout(
            Duration::from_secs(seconds),
            self.provider.generate(&generation.prompt),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout { seconds }));

        let outcome = self.settle(&id, result.map_err(MarketError::from)).await?;
        Ok(outcome.into_generation())
    }

    /// Create a task row for `generation` and hand it to the dispatcher.
    ///
    /// If the dispatcher refuses the task, the generation is failed and
    /// refunded and the task is closed.
    async fn enqueue(&self, generation: Generation, retry_count: u32) -> Result<(Generation, Task)> {
        let mut task = Task::queued(generation.id, retry_count);
        self.store.create_task(&task).await?;

        let message = TaskMessage {
            task_id: task.id,
            generation_id: generation.id,
            prompt: generation.prompt.clone(),
        };

        match self.dispatcher.dispatch(message).await {
            Ok(()) => {
                tracing::info!(
                    generation_id = %generation.id,
                    task_id = %task.id,
                    retry_count,
                    "Task dispatched"
                );
                Ok((generation, task))
            }
            Err(e) => {
                tracing::warn!(
                    generation_id = %generation.id,
                    task_id = %task.id,
                    error = %e,
                    "Dispatch failed"
                );
                task.finish(TaskStatus::Failed, Some(e.to_string()));
                self.store.update_task(&task).await?;
                let outcome = self
                    .store
                    .apply_transition(
                        &generation.id,
                        Transition::Fail {
                            reason: format!("dispatch failed: {e}"),
                        },
                    )
                    .await?;
                Ok((outcome.into_generation(), task))
            }
        }
    }

    // =========================================================================
    // Outcome
    // =========================================================================

    /// Fold a provider outcome into the generation.
    ///
    /// Success moves it to `Success`; any error moves it to `Failed` and
    /// refunds. A generation that is already terminal is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns store errors, or `InvalidTransition` if a success is reported
    /// for a generation that was never started.
    pub async fn settle(
        &self,
        generation_id: &GenerationId,
        result: Result<GeneratedImage>,
    ) -> Result<TransitionOutcome> {
        let transition = match result {
            Ok(image) => Transition::Complete(image),
            Err(e) => {
                tracing::warn!(generation_id = %generation_id, error = %e, "Generation failed");
                Transition::Fail {
                    reason: e.to_string(),
                }
            }
        };

        let outcome = self.store.apply_transition(generation_id, transition).await?;
        match &outcome {
            TransitionOutcome::Applied { generation, refund } => {
                tracing::info!(
                    generation_id = %generation.id,
                    status = %generation.status,
                    refunded = refund.as_ref().map_or(0, |tx| tx.amount),
                    "Generation settled"
                );
            }
            TransitionOutcome::AlreadySettled(generation) => {
                tracing::debug!(
                    generation_id = %generation.id,
                    status = %generation.status,
                    "Outcome for settled generation ignored"
                );
            }
        }
        Ok(outcome)
    }

    /// Cancel a generation and refund it.
    ///
    /// Buyers may only cancel their own `Pending` generations. Admins
    /// (`as_buyer = None`) may also cancel `Processing` ones.
    ///
    /// # Errors
    ///
    /// - `GenerationNotFound` if it does not exist or belongs to someone else.
    /// - `InvalidTransition` if it is not cancelable by the caller.
    pub async fn cancel(
        &self,
        generation_id: &GenerationId,
        as_buyer: Option<&UserId>,
        reason: &str,
    ) -> Result<TransitionOutcome> {
        let generation = self.load_generation(generation_id).await?;

        if let Some(buyer) = as_buyer {
            if generation.buyer_id != *buyer {
                return Err(MarketError::GenerationNotFound {
                    generation_id: generation_id.to_string(),
                });
            }
            if generation.status != GenerationStatus::Pending {
                return Err(MarketError::InvalidTransition {
                    from: generation.status,
                    transition: "cancel",
                });
            }
        }

        let outcome = self
            .store
            .apply_transition(
                generation_id,
                Transition::Cancel {
                    reason: reason.to_string(),
                },
            )
            .await?;

        if let TransitionOutcome::AlreadySettled(generation) = &outcome {
            return Err(MarketError::InvalidTransition {
                from: generation.status,
                transition: "cancel",
            });
        }

        self.close_open_tasks(generation_id, TaskStatus::Canceled, reason)
            .await?;
        tracing::info!(generation_id = %generation_id, reason = %reason, "Generation canceled");
        Ok(outcome)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// A worker picked up a task.
    ///
    /// # Errors
    ///
    /// - `TaskNotFound` if the task does not exist.
    /// - `InvalidTransition` if the task is not queued or the generation is
    ///   already settled. In the latter case the task is closed as canceled.
    pub async fn start_task(&self, task_id: &TaskId, worker_id: &str) -> Result<(Task, Generation)> {
        let mut task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Queued {
            let generation = self.load_generation(&task.generation_id).await?;
            return Err(MarketError::InvalidTransition {
                from: generation.status,
                transition: "start",
            });
        }

        match self
            .store
            .apply_transition(&task.generation_id, Transition::Start)
            .await
        {
            Ok(outcome) => {
                task.start(worker_id);
                self.store.update_task(&task).await?;
                tracing::info!(task_id = %task.id, worker_id = %worker_id, "Task started");
                Ok((task, outcome.into_generation()))
            }
            Err(e) => {
                let err = MarketError::from(e);
                if matches!(err, MarketError::InvalidTransition { .. }) {
                    task.finish(TaskStatus::Canceled, Some("generation already settled".into()));
                    self.store.update_task(&task).await?;
                }
                Err(err)
            }
        }
    }

    /// A worker finished a task with an image.
    ///
    /// A report for a task that already finished changes nothing.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound`, store errors, or `InvalidTransition` if the
    /// task finished and a newer task is running the generation.
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        image: GeneratedImage,
    ) -> Result<TransitionOutcome> {
        let mut task = self.load_task(task_id).await?;
        let generation = self.load_generation(&task.generation_id).await?;

        if task.status.is_terminal() {
            if generation.is_settled() {
                return Ok(TransitionOutcome::AlreadySettled(generation));
            }
            // A newer task owns the generation now.
            return Err(MarketError::InvalidTransition {
                from: generation.status,
                transition: "complete",
            });
        }

        if generation.status == GenerationStatus::Pending {
            self.store
                .apply_transition(&generation.id, Transition::Start)
                .await?;
        }

        let outcome = self.settle(&generation.id, Ok(image)).await?;

        let status = match outcome.generation().status {
            GenerationStatus::Success => TaskStatus::Success,
            _ => TaskStatus::Canceled,
        };
        task.finish(status, None);
        self.store.update_task(&task).await?;
        Ok(outcome)
    }

    /// A worker gave up on a task.
    ///
    /// While retries remain the generation is requeued under a new task with
    /// the same debit. Otherwise it is failed and refunded. Repeated or late
    /// reports for a task that already finished are ignored.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` or store errors.
    pub async fn fail_task(&self, task_id: &TaskId, error: &str) -> Result<TaskFailure> {
        let mut task = self.load_task(task_id).await?;
        let generation = self.load_generation(&task.generation_id).await?;

        // Only the live task may requeue or settle its generation.
        if task.status.is_terminal() {
            tracing::debug!(
                task_id = %task.id,
                task_status = %task.status,
                generation_status = %generation.status,
                "Failure report for finished task ignored"
            );
            return Ok(TaskFailure::Ignored(generation));
        }

        task.finish(TaskStatus::Failed, Some(error.to_string()));
        self.store.update_task(&task).await?;

        let retry_allowed = task.retry_count < self.max_task_retries && !generation.is_settled();

        if retry_allowed {
            let generation = if generation.status == GenerationStatus::Processing {
                self.store
                    .apply_transition(&generation.id, Transition::Requeue)
                    .await?
                    .into_generation()
            } else {
                generation
            };
            tracing::info!(
                generation_id = %generation.id,
                failed_task = %task.id,
                retry_count = task.retry_count + 1,
                "Retrying generation"
            );
            let (generation, task) = self.enqueue(generation, task.retry_count + 1).await?;
            if generation.is_settled() {
                return Ok(TaskFailure::Settled(TransitionOutcome::AlreadySettled(
                    generation,
                )));
            }
            return Ok(TaskFailure::Retried { generation, task });
        }

        let outcome = self
            .settle(
                &generation.id,
                Err(MarketError::ProviderFailure(error.to_string())),
            )
            .await?;
        Ok(TaskFailure::Settled(outcome))
    }

    /// Run a dispatched task end to end through the provider queue.
    pub async fn execute_task(&self, message: &TaskMessage, worker_id: &str) {
        let generation = match self.start_task(&message.task_id, worker_id).await {
            Ok((_, generation)) => generation,
            Err(e) => {
                tracing::warn!(task_id = %message.task_id, error = %e, "Task not started");
                return;
            }
        };

        let result = self.run_queued(&generation).await;

        let reported = match result {
            Ok(image) => self.complete_task(&message.task_id, image).await.map(|_| ()),
            Err(e) => self
                .fail_task(&message.task_id, &e.to_string())
                .await
                .map(|_| ()),
        };
        if let Err(e) = reported {
            tracing::error!(task_id = %message.task_id, error = %e, "Failed to record task outcome");
        }
    }

    /// Submit to the provider queue and poll until the request finishes or
    /// the provider timeout elapses.
    async fn run_queued(
        &self,
        generation: &Generation,
    ) -> std::result::Result<GeneratedImage, ProviderError> {
        let seconds = self.provider_timeout_seconds;
        tokio::time::timeout(Duration::from_secs(seconds), self.poll_until_done(generation))
            .await
            .unwrap_or(Err(ProviderError::Timeout { seconds }))
    }

    async fn poll_until_done(
        &self,
        generation: &Generation,
    ) -> std::result::Result<GeneratedImage, ProviderError> {
        let request_id = self.provider.submit(&generation.prompt).await?;
        if let Err(e) = self
            .store
            .apply_transition(
                &generation.id,
                Transition::AttachRequest {
                    request_id: request_id.clone(),
                },
            )
            .await
        {
            tracing::warn!(generation_id = %generation.id, error = %e, "Could not record request id");
        }

        loop {
            match self.provider.poll(&request_id).await? {
                PollStatus::Completed(image) => return Ok(image),
                PollStatus::Failed(reason) => return Err(ProviderError::Failed(reason)),
                PollStatus::Queued | PollStatus::InProgress => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    // =========================================================================
    // Recovery and audit
    // =========================================================================

    /// Fail and refund generations that have not moved for longer than the
    /// stale threshold.
    ///
    /// # Errors
    ///
    /// Returns store errors from the listing. Per-generation failures are
    /// logged and skipped.
    pub async fn sweep_stale(&self) -> Result<SweepReport> {
        let cutoff = Utc::now() - self.stale_after;
        let stale = self.store.list_stale_generations(cutoff, SWEEP_BATCH).await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        for generation in stale {
            let reason = format!("generation timed out in {} state", generation.status);
            match self
                .store
                .apply_transition(&generation.id, Transition::Fail { reason: reason.clone() })
                .await
            {
                Ok(TransitionOutcome::Applied { .. }) => {
                    if let Err(e) = self
                        .close_open_tasks(&generation.id, TaskStatus::Failed, &reason)
                        .await
                    {
                        tracing::warn!(generation_id = %generation.id, error = %e, "Could not close tasks");
                    }
                    report.refunded.push(generation.id);
                }
                Ok(TransitionOutcome::AlreadySettled(_)) => report.already_settled += 1,
                Err(e) => {
                    tracing::warn!(generation_id = %generation.id, error = %e, "Stale sweep skipped generation");
                }
            }
        }

        if !report.refunded.is_empty() {
            tracing::info!(
                refunded = report.refunded.len(),
                examined = report.examined,
                "Stale generations refunded"
            );
        }
        Ok(report)
    }

    /// Replay a user's ledger against their cached balance.
    ///
    /// # Errors
    ///
    /// Returns `UserNotFound` or store errors.
    pub async fn audit_ledger(&self, user_id: &UserId) -> Result<LedgerAudit> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| MarketError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        let ledger = self.store.ledger_for_user(user_id).await?;

        let (replayed_balance, violation) = match verify_ledger(&ledger, user.credit_balance) {
            Ok(balance) => (Some(balance), None),
            Err(violation) => {
                tracing::error!(user_id = %user_id, violation = %violation, "Ledger audit failed");
                (None, Some(violation.to_string()))
            }
        };

        Ok(LedgerAudit {
            user_id: *user_id,
            cached_balance: user.credit_balance,
            replayed_balance,
            entries: ledger.len(),
            consistent: violation.is_none(),
            violation,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load_generation(&self, generation_id: &GenerationId) -> Result<Generation> {
        self.store
            .get_generation(generation_id)
            .await?
            .ok_or_else(|| MarketError::GenerationNotFound {
                generation_id: generation_id.to_string(),
            })
    }

    async fn load_task(&self, task_id: &TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| MarketError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn close_open_tasks(
        &self,
        generation_id: &GenerationId,
        status: TaskStatus,
        reason: &str,
    ) -> Result<()> {
        for mut task in self.store.list_tasks_by_generation(generation_id).await? {
            if !task.status.is_terminal() {
                task.finish(status, Some(reason.to_string()));
                self.store.update_task(&task).await?;
            }
        }
        Ok(())
    }
}

/// Run [`Settlement::sweep_stale`] every `interval` until the task is aborted.
pub fn spawn_sweeper(settlement: Arc<Settlement>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = settlement.sweep_stale().await {
                tracing::warn!(error = %e, "Stale sweep failed");
            }
        }
    })
}
