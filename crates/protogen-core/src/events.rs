//! Progress reporting during a run.
//!
//! The engine calls a [`ProgressObserver`] when each attempted stage starts
//! and finishes. Any `Fn(&StageProgress)` closure is an observer; front-ends
//! that prefer to poll can use [`progress_channel`] and drain the returned
//! [`ProgressStream`].

use serde::Serialize;
use tokio::sync::mpsc;

use protogen_pm::DeliverableKind;

use crate::error::ErrorKind;

// ── Progress Payload ─────────────────────────────────────────

/// Outcome of one stage, reported as soon as the stage finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageProgress {
    pub kind: DeliverableKind,
    pub success: bool,
    /// Zero-based position of the stage in the requested order.
    pub stage_index: usize,
    pub total_stages: usize,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
}

// ── Observer ─────────────────────────────────────────────────

/// Receives per-stage notifications. Called on the engine's task; keep it fast.
pub trait ProgressObserver: Send + Sync {
    fn on_stage_started(&self, _kind: DeliverableKind, _stage_index: usize, _total_stages: usize) {
    }

    fn on_stage_finished(&self, progress: &StageProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&StageProgress) + Send + Sync,
{
    fn on_stage_finished(&self, progress: &StageProgress) {
        self(progress)
    }
}

// ── Channel Stream ───────────────────────────────────────────

/// Events delivered through a [`ProgressStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    StageStarted {
        kind: DeliverableKind,
        stage_index: usize,
        total_stages: usize,
    },
    StageFinished(StageProgress),
}

/// Observer half of [`progress_channel`].
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressObserver for ChannelObserver {
    fn on_stage_started(&self, kind: DeliverableKind, stage_index: usize, total_stages: usize) {
        // A dropped stream only means nobody is listening.
        let _ = self.tx.send(ProgressEvent::StageStarted {
            kind,
            stage_index,
            total_stages,
        });
    }

    fn on_stage_finished(&self, progress: &StageProgress) {
        let _ = self.tx.send(ProgressEvent::StageFinished(progress.clone()));
    }
}

/// Receiving half of [`progress_channel`].
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressStream {
    /// Get the next progress event.
    ///
    /// Returns `None` once every [`ChannelObserver`] clone has been dropped,
    /// which happens when the engine holding it is dropped.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

/// Create an observer that forwards events to a stream.
pub fn progress_channel() -> (ChannelObserver, ProgressStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelObserver { tx }, ProgressStream { rx })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn progress(success: bool) -> StageProgress {
        StageProgress {
            kind: DeliverableKind::Personas,
            success,
            stage_index: 1,
            total_stages: 3,
            attempts: 1,
            error_kind: (!success).then_some(ErrorKind::Server),
        }
    }

    #[test]
    fn test_should_accept_closure_as_observer() {
        let seen = Mutex::new(Vec::new());
        let observer = |p: &StageProgress| seen.lock().expect("lock").push(p.success);

        observer.on_stage_started(DeliverableKind::Personas, 0, 1);
        observer.on_stage_finished(&progress(true));
        observer.on_stage_finished(&progress(false));

        assert_eq!(*seen.lock().expect("lock"), vec![true, false]);
    }

    #[tokio::test]
    async fn test_should_forward_events_through_channel() {
        let (observer, mut stream) = progress_channel();

        observer.on_stage_started(DeliverableKind::Personas, 1, 3);
        observer.on_stage_finished(&progress(true));
        drop(observer);

        assert_eq!(
            stream.next().await,
            Some(ProgressEvent::StageStarted {
                kind: DeliverableKind::Personas,
                stage_index: 1,
                total_stages: 3,
            })
        );
        assert_eq!(
            stream.next().await,
            Some(ProgressEvent::StageFinished(progress(true)))
        );
        assert_eq!(stream.next().await, None);
    }
}
