//! Create-protocol dialog workflow.
//!
//! The dialog opens immediately while the rental's protocols load in the
//! background. When the load settles the dialog either shows its form
//! (`Ready`) or explains why it cannot (`Blocked`). If the load fails the
//! dialog closes itself (`Aborted`), the selection is dropped and the
//! workflow is back in `Idle` with the failure kept for the UI to show.
//!
//! `WorkflowState::apply` is a pure transition function; `WorkflowController`
//! drives it from a coordinator and a background task.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::coordinator::ProtocolCoordinator;
use crate::models::{ProtocolKind, ProtocolSet};

/// Buffer for load outcomes; at most one load is outstanding per dialog.
const CHANNEL_BUFFER_SIZE: usize = 8;

/// Shown when the dialog closes because its data could not be loaded.
pub const LOAD_FAILED_MESSAGE: &str = "Failed to load protocols. Please try again.";

/// The rental and protocol kind a dialog was opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogSelection {
    pub rental_id: String,
    pub kind: ProtocolKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// A return protocol was requested before the vehicle was handed over
    MissingHandover,
}

impl BlockReason {
    pub fn message(&self) -> &'static str {
        match self {
            BlockReason::MissingHandover => {
                "The vehicle has not been handed over yet. Create the handover protocol first."
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum WorkflowState {
    #[default]
    Idle,
    /// Shown, waiting for the background load
    DialogOpen(DialogSelection),
    Ready {
        selection: DialogSelection,
        detail: Arc<ProtocolSet>,
    },
    Blocked {
        selection: DialogSelection,
        reason: BlockReason,
    },
    /// Dialog closed after the load failed. Left as soon as the failure
    /// has been handed to the UI.
    Aborted { error: String },
}

#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    OpenCreate {
        rental_id: String,
        kind: ProtocolKind,
    },
    DetailLoaded {
        rental_id: String,
        detail: Arc<ProtocolSet>,
    },
    DetailFailed {
        rental_id: String,
        error: String,
    },
    /// The failure of an aborted dialog was recorded for display
    FailureReported,
    Cancel,
}

/// Why the last dialog closed on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogFailure {
    pub selection: DialogSelection,
    pub error: String,
}

impl DialogFailure {
    pub fn message(&self) -> &'static str {
        LOAD_FAILED_MESSAGE
    }
}

impl WorkflowState {
    /// Compute the next state. Events that do not apply to the current state
    /// (including load outcomes for another rental) leave it unchanged.
    pub fn apply(self, event: WorkflowEvent) -> WorkflowState {
        match (self, event) {
            (_, WorkflowEvent::Cancel) => WorkflowState::Idle,

            (WorkflowState::Idle | WorkflowState::Aborted { .. }, WorkflowEvent::OpenCreate { rental_id, kind }) => {
                WorkflowState::DialogOpen(DialogSelection { rental_id, kind })
            }

            (WorkflowState::DialogOpen(selection), WorkflowEvent::DetailLoaded { rental_id, detail })
                if selection.rental_id == rental_id =>
            {
                match selection.kind.prerequisite() {
                    Some(required) if !detail.has(required) => WorkflowState::Blocked {
                        selection,
                        reason: BlockReason::MissingHandover,
                    },
                    _ => WorkflowState::Ready { selection, detail },
                }
            }

            (WorkflowState::DialogOpen(selection), WorkflowEvent::DetailFailed { rental_id, error })
                if selection.rental_id == rental_id =>
            {
                WorkflowState::Aborted { error }
            }

            (WorkflowState::Aborted { .. }, WorkflowEvent::FailureReported) => WorkflowState::Idle,

            (state, _) => state,
        }
    }

    pub fn selection(&self) -> Option<&DialogSelection> {
        match self {
            WorkflowState::Idle | WorkflowState::Aborted { .. } => None,
            WorkflowState::DialogOpen(selection)
            | WorkflowState::Ready { selection, .. }
            | WorkflowState::Blocked { selection, .. } => Some(selection),
        }
    }

    pub fn is_dialog_open(&self) -> bool {
        matches!(
            self,
            WorkflowState::DialogOpen(_) | WorkflowState::Ready { .. } | WorkflowState::Blocked { .. }
        )
    }

    /// Still waiting for the background load.
    pub fn is_pending(&self) -> bool {
        matches!(self, WorkflowState::DialogOpen(_))
    }

    /// Text to show the user, if the state calls for any.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            WorkflowState::Blocked { reason, .. } => Some(reason.message()),
            WorkflowState::Aborted { .. } => Some(LOAD_FAILED_MESSAGE),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::DialogOpen(_) => "dialog-open",
            WorkflowState::Ready { .. } => "ready",
            WorkflowState::Blocked { .. } => "blocked",
            WorkflowState::Aborted { .. } => "aborted",
        }
    }
}

/// Runs the dialog workflow against a coordinator.
///
/// Load outcomes come back over a channel; call `check_background_tasks`
/// from the UI loop or `wait_for_update` to block until the dialog settles.
/// A failed load closes the dialog and leaves a `DialogFailure` behind for
/// `take_failure`.
pub struct WorkflowController {
    coordinator: ProtocolCoordinator,
    state: WorkflowState,
    last_failure: Option<DialogFailure>,
    tx: mpsc::Sender<WorkflowEvent>,
    rx: mpsc::Receiver<WorkflowEvent>,
}

impl WorkflowController {
    pub fn new(coordinator: ProtocolCoordinator) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        Self {
            coordinator,
            state: WorkflowState::Idle,
            last_failure: None,
            tx,
            rx,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn last_failure(&self) -> Option<&DialogFailure> {
        self.last_failure.as_ref()
    }

    /// Hand the last failure to the UI, once.
    pub fn take_failure(&mut self) -> Option<DialogFailure> {
        self.last_failure.take()
    }

    /// Open the create dialog for `kind` right away and load the rental's
    /// protocols in the background. Ignored while a dialog is shown.
    pub fn open_create(&mut self, rental_id: &str, kind: ProtocolKind) {
        if self.state.is_dialog_open() {
            debug!(rental_id, %kind, state = self.state.name(), "Dialog already open, ignoring");
            return;
        }
        self.last_failure = None;
        self.transition(WorkflowEvent::OpenCreate {
            rental_id: rental_id.to_string(),
            kind,
        });

        let Ok(handle) = Handle::try_current() else {
            warn!(rental_id, "No runtime available to load protocols");
            self.transition(WorkflowEvent::DetailFailed {
                rental_id: rental_id.to_string(),
                error: "no async runtime available".to_string(),
            });
            return;
        };

        let coordinator = self.coordinator.clone();
        let tx = self.tx.clone();
        let rental_id = rental_id.to_string();
        handle.spawn(async move {
            let result = coordinator.load_detail(&rental_id).await;
            let event = match result {
                Ok(detail) => WorkflowEvent::DetailLoaded { rental_id, detail },
                Err(e) => WorkflowEvent::DetailFailed {
                    rental_id,
                    error: e.to_string(),
                },
            };
            if let Err(e) = tx.send(event).await {
                error!(error = %e, "Failed to send protocol load result - channel closed");
            }
        });
    }

    /// Apply every outcome that has arrived, without waiting.
    pub fn check_background_tasks(&mut self) {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        for event in events {
            self.transition(event);
        }
    }

    /// Wait until the open dialog settles. Returns immediately when nothing
    /// is pending.
    pub async fn wait_for_update(&mut self) -> &WorkflowState {
        while self.state.is_pending() {
            match self.rx.recv().await {
                Some(event) => self.transition(event),
                None => break,
            }
        }
        &self.state
    }

    /// Close the dialog and forget the selection. The caches are not touched.
    pub fn cancel(&mut self) {
        self.transition(WorkflowEvent::Cancel);
    }

    fn transition(&mut self, event: WorkflowEvent) {
        let from = self.state.name();
        let selection = self.state.selection().cloned();
        self.state = std::mem::take(&mut self.state).apply(event);
        let to = self.state.name();
        if from == to {
            return;
        }

        match &self.state {
            WorkflowState::Aborted { error } => {
                let Some(selection) = selection else {
                    return;
                };
                warn!(rental_id = %selection.rental_id, kind = %selection.kind, error = %error, "Protocol dialog aborted");
                self.last_failure = Some(DialogFailure {
                    selection,
                    error: error.clone(),
                });
                self.state = std::mem::take(&mut self.state).apply(WorkflowEvent::FailureReported);
            }
            WorkflowState::Blocked { selection, reason } => {
                info!(rental_id = %selection.rental_id, kind = %selection.kind, ?reason, "Protocol dialog blocked");
            }
            _ => debug!(from, to, "Workflow transition"),
        }
    }
}
