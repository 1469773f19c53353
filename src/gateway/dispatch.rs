// src/gateway/dispatch.rs
// Per-conversation serialization and turn-deadline enforcement, per spec §5.
// Grounded on the teacher's session/manager.rs per-session actor shape,
// generalized from an in-memory session map to a bounded mailbox with
// explicit overflow (the teacher has no equivalent back-pressure policy).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, warn, Instrument};

use crate::preprocess::AcceptedTurn;
use crate::state::AppState;
use crate::workflow::{EnqueueTurn, OutboxEntryDraft, OutboxEnqueuer, WorkflowError};

struct Mailbox {
    queue: Mutex<VecDeque<AcceptedTurn>>,
    notify: Notify,
}

/// Routes accepted turns into one bounded, FIFO mailbox per `conversation_id`
/// and runs each conversation's mailbox serially on its own spawned task, so
/// at most one turn per conversation executes at a time while different
/// conversations run fully in parallel (spec §5 Ordering guarantees).
pub struct ConversationDispatcher {
    state: Arc<AppState>,
    mailboxes: Mutex<HashMap<String, Arc<Mailbox>>>,
    queue_depth: usize,
    turn_deadline: Duration,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversationDispatcher {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        let queue_depth = state.config.workflow.turn_queue_depth.max(1);
        let turn_deadline = Duration::from_secs(state.config.workflow.turn_deadline_secs);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            state,
            mailboxes: Mutex::new(HashMap::new()),
            queue_depth,
            turn_deadline,
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Signals every mailbox worker to stop accepting new notifications once
    /// its queue drains, then waits (up to `timeout`) for them all to exit.
    /// Turns already queued are still run; only the idle-wait is skipped.
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().await);
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("graceful shutdown timed out before all mailbox workers drained");
        }
    }

    /// Enqueues `turn` behind its conversation's mailbox, spawning the
    /// mailbox's worker task the first time that conversation is seen.
    /// When the queue is already at `queue_depth`, the oldest pending turn
    /// is dropped to make room (spec §5: "overflow drops the oldest").
    pub async fn dispatch(self: Arc<Self>, turn: AcceptedTurn) {
        let mailbox = Self::mailbox_for(&self, &turn.conversation_id).await;

        let mut queue = mailbox.queue.lock().await;
        if queue.len() >= self.queue_depth {
            queue.pop_front();
            metrics::counter!("turn_queue_overflow_total").increment(1);
            warn!(conversation_id = %turn.conversation_id, "turn queue full, dropped oldest pending turn");
        }
        queue.push_back(turn);
        drop(queue);
        mailbox.notify.notify_one();
    }

    async fn mailbox_for(dispatcher: &Arc<Self>, conversation_id: &str) -> Arc<Mailbox> {
        let mut mailboxes = dispatcher.mailboxes.lock().await;
        if let Some(mailbox) = mailboxes.get(conversation_id) {
            return mailbox.clone();
        }
        let mailbox = Arc::new(Mailbox {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        mailboxes.insert(conversation_id.to_string(), mailbox.clone());

        let spawned = dispatcher.clone();
        let worker_mailbox = mailbox.clone();
        let shutdown_rx = dispatcher.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            Self::run_mailbox(spawned, worker_mailbox, shutdown_rx).await;
        });
        dispatcher.workers.lock().await.push(handle);

        mailbox
    }

    /// One task per conversation, alive until its queue empties after a
    /// shutdown signal: waits for work, drains the queue serially, sleeps
    /// when empty. A shutdown only stops the idle-wait, never a turn already
    /// queued, so in-flight work is never abandoned mid-drain.
    async fn run_mailbox(self: Arc<Self>, mailbox: Arc<Mailbox>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let next = {
                let mut queue = mailbox.queue.lock().await;
                queue.pop_front()
            };
            match next {
                Some(turn) => self.run_one(turn).await,
                None if *shutdown_rx.borrow() => return,
                None => {
                    tokio::select! {
                        _ = mailbox.notify.notified() => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
    }

    async fn run_one(&self, turn: AcceptedTurn) {
        let conversation_id = turn.conversation_id.clone();
        let correlation_id = turn.correlation_id.clone();
        let span = tracing::info_span!("dispatch_turn", correlation_id = %correlation_id, conversation_id = %conversation_id);
        let outcome = tokio::time::timeout(self.turn_deadline, self.state.orchestrator.run_turn(turn))
            .instrument(span)
            .await;
        match outcome {
            Ok(Ok(_result)) => {}
            Ok(Err(e)) => {
                error!(conversation_id = %conversation_id, error = %e, "turn failed");
                metrics::counter!("workflow_turn_errors_total").increment(1);
            }
            Err(_) => self.handle_deadline_exceeded(&conversation_id).await,
        }
    }

    /// Spec §5 Cancellation: records the expiry as a checkpoint and enqueues
    /// a single apology+retry message, without re-running the node that
    /// timed out (its outstanding I/O is simply abandoned by `timeout`).
    async fn handle_deadline_exceeded(&self, conversation_id: &str) {
        warn!(conversation_id = %conversation_id, "turn deadline exceeded");
        metrics::counter!("workflow_turn_deadline_exceeded_total").increment(1);

        let conv = match self
            .state
            .orchestrator
            .store()
            .mutate(conversation_id, "turn_expired", |conv| {
                conv.record_failure();
                Ok(())
            })
            .await
        {
            Ok(conv) => conv,
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "failed to checkpoint turn expiry");
                return;
            }
        };

        self.reply_without_turn(
            conversation_id.to_string(),
            conv.instance.clone(),
            "kumon:fallback:error:level2",
        )
        .await;
    }

    /// Sends a single templated reply outside the turn/checkpoint machinery,
    /// for preprocessor drops (after-hours, scope refusal) and deadline
    /// apologies that have no accepted turn to attach to.
    pub async fn reply_without_turn(&self, conversation_id: String, instance: String, template_name: &str) {
        let Ok(template) = self.state.templates.resolve(template_name, "prod") else {
            error!(template = template_name, "template resolution failed for out-of-turn reply");
            return;
        };
        let Ok(text) = self
            .state
            .templates
            .render(&template, &HashMap::new(), &crate::conversation::CollectedData::default())
        else {
            error!(template = template_name, "template render failed for out-of-turn reply");
            return;
        };

        let turn_id = uuid::Uuid::new_v4().to_string();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let result: Result<(), WorkflowError> = self
            .state
            .outbox
            .enqueue_turn(EnqueueTurn {
                conversation_id: conversation_id.clone(),
                turn_id,
                instance,
                peer_id: conversation_id.clone(),
                entries: vec![OutboxEntryDraft { seq: 1, text }],
                correlation_id,
            })
            .await;
        if let Err(e) = result {
            error!(conversation_id = %conversation_id, error = %e, "failed to enqueue out-of-turn reply");
        }
    }
}
