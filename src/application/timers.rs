//! Cancellable per-session timers
//!
//! Each timer is a spawned task that sleeps and then sends a [`TimerEvent`]
//! to the orchestrator's timer loop, unless its stop channel fires first.
//! Dropping [`SessionTimers`] stops every timer it owns; after
//! [`release`](SessionTimers::release) nothing can be armed again.

use crate::domain::shared::value_objects::CallId;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Max call duration elapsed
    Deadline { call_id: CallId },
    /// No complete entry for the stage within its timeout
    StageTimeout {
        call_id: CallId,
        stage_key: String,
        generation: u64,
    },
    /// Keystroke buffer idle for the inactivity window
    InactivityFlush {
        call_id: CallId,
        stage_key: String,
        generation: u64,
    },
    /// Grace window after finalize elapsed
    Evict { call_id: CallId },
}

impl TimerEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            TimerEvent::Deadline { call_id }
            | TimerEvent::StageTimeout { call_id, .. }
            | TimerEvent::InactivityFlush { call_id, .. }
            | TimerEvent::Evict { call_id } => call_id,
        }
    }
}

#[derive(Debug)]
pub struct SessionTimers {
    tx: UnboundedSender<TimerEvent>,
    call_id: CallId,
    deadline_stop: Option<oneshot::Sender<()>>,
    stage_stop: Option<oneshot::Sender<()>>,
    flush_stop: Option<oneshot::Sender<()>>,
    stage_generation: u64,
    flush_generation: u64,
    released: bool,
}

impl SessionTimers {
    pub fn new(call_id: CallId, tx: UnboundedSender<TimerEvent>) -> Self {
        Self {
            tx,
            call_id,
            deadline_stop: None,
            stage_stop: None,
            flush_stop: None,
            stage_generation: 0,
            flush_generation: 0,
            released: false,
        }
    }

    pub fn start_deadline(&mut self, after: Duration) {
        if self.released || self.deadline_stop.is_some() {
            return;
        }
        let event = TimerEvent::Deadline {
            call_id: self.call_id.clone(),
        };
        self.deadline_stop = Some(spawn_timer(self.tx.clone(), after, event));
    }

    /// (Re)arm the stage timeout; a previous one is cancelled
    pub fn arm_stage_timeout(&mut self, stage_key: &str, after: Duration) {
        self.cancel_stage_timeout();
        if self.released {
            return;
        }
        self.stage_generation += 1;
        let event = TimerEvent::StageTimeout {
            call_id: self.call_id.clone(),
            stage_key: stage_key.to_string(),
            generation: self.stage_generation,
        };
        self.stage_stop = Some(spawn_timer(self.tx.clone(), after, event));
    }

    pub fn cancel_stage_timeout(&mut self) {
        stop(&mut self.stage_stop);
    }

    /// (Re)arm the inactivity flush; a previous one is cancelled
    pub fn arm_flush(&mut self, stage_key: &str, after: Duration) {
        self.cancel_flush();
        if self.released {
            return;
        }
        self.flush_generation += 1;
        let event = TimerEvent::InactivityFlush {
            call_id: self.call_id.clone(),
            stage_key: stage_key.to_string(),
            generation: self.flush_generation,
        };
        self.flush_stop = Some(spawn_timer(self.tx.clone(), after, event));
    }

    pub fn cancel_flush(&mut self) {
        stop(&mut self.flush_stop);
    }

    /// A fired stage timeout still belongs to the armed timer
    pub fn is_current_stage_timeout(&self, generation: u64) -> bool {
        self.stage_stop.is_some() && generation == self.stage_generation
    }

    pub fn is_current_flush(&self, generation: u64) -> bool {
        self.flush_stop.is_some() && generation == self.flush_generation
    }

    /// Consume the armed stage timeout after it fired
    pub fn clear_stage_timeout(&mut self) {
        self.stage_stop = None;
    }

    pub fn clear_flush(&mut self) {
        self.flush_stop = None;
    }

    pub fn stop_all(&mut self) {
        stop(&mut self.deadline_stop);
        stop(&mut self.stage_stop);
        stop(&mut self.flush_stop);
    }

    /// Stop everything and refuse further arming
    pub fn release(&mut self) {
        self.released = true;
        self.stop_all();
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn active_count(&self) -> usize {
        [&self.deadline_stop, &self.stage_stop, &self.flush_stop]
            .iter()
            .filter(|t| t.is_some())
            .count()
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Send `Evict` after `after`; not owned by the session since it outlives cleanup
pub fn schedule_eviction(tx: UnboundedSender<TimerEvent>, call_id: CallId, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(TimerEvent::Evict { call_id });
    });
}

fn spawn_timer(
    tx: UnboundedSender<TimerEvent>,
    after: Duration,
    event: TimerEvent,
) -> oneshot::Sender<()> {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(after) => {
                let _ = tx.send(event);
            }
            _ = &mut stop_rx => {}
        }
    });
    stop_tx
}

fn stop(slot: &mut Option<oneshot::Sender<()>>) {
    if let Some(stop) = slot.take() {
        let _ = stop.send(());
    }
}
