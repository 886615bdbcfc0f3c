//! Communication channels and the service loop in front of the coordinator

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument};

use crate::coordinator::AgentCoordinator;
use crate::error::CoordinatorError;
use crate::protocol::{Event, Op, SubmissionId};

/// Channel pair for the service side
pub struct ChannelPair {
    /// Receiver for operations
    pub op_rx: mpsc::UnboundedReceiver<Op>,
    /// Sender for events
    pub event_tx: mpsc::UnboundedSender<Event>,
}

/// Client-side channel for talking to a [`DebugService`]
#[derive(Clone)]
pub struct CoordinatorChannel {
    op_tx: mpsc::UnboundedSender<Op>,
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>,
}

impl CoordinatorChannel {
    /// Returns the client channel and the service channel pair
    pub fn new() -> (Self, ChannelPair) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let channel = Self {
            op_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
        };

        (channel, ChannelPair { op_rx, event_tx })
    }

    /// Send an operation, returning its submission id
    pub fn send(&self, op: Op) -> Result<SubmissionId, CoordinatorError> {
        let sub_id = *op.sub_id();
        self.op_tx
            .send(op)
            .map_err(|_| CoordinatorError::ChannelClosed)?;
        Ok(sub_id)
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<Event> {
        self.event_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Receive the next event
    pub async fn recv(&self) -> Option<Event> {
        self.event_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.op_tx.is_closed()
    }
}

/// Op loop answering the three external queries: submit, poll, agent health
pub struct DebugService {
    coordinator: Arc<AgentCoordinator>,
    op_rx: mpsc::UnboundedReceiver<Op>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl DebugService {
    /// Wire `coordinator` to a fresh channel. Pipeline events go to the same stream.
    pub fn with_channel(coordinator: AgentCoordinator) -> (Self, CoordinatorChannel) {
        let (channel, pair) = CoordinatorChannel::new();
        let coordinator = Arc::new(coordinator.with_events(pair.event_tx.clone()));
        let service = Self {
            coordinator,
            op_rx: pair.op_rx,
            event_tx: pair.event_tx,
        };
        (service, channel)
    }

    pub fn coordinator(&self) -> &Arc<AgentCoordinator> {
        &self.coordinator
    }

    /// Run until every client channel is dropped
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!("Starting debug service");

        while let Some(op) = self.op_rx.recv().await {
            self.handle_op(op).await;
        }

        info!("Debug service stopped");
    }

    async fn handle_op(&self, op: Op) {
        debug!(sub_id = %op.sub_id(), "Handling op");

        let event = match op {
            Op::SubmitDebug {
                sub_id,
                error,
                codebase,
            } => match self.coordinator.submit_tracked(error, codebase, Some(sub_id)) {
                // SessionStarted is emitted by the coordinator
                Ok(_) => return,
                Err(e) => Self::error_event(sub_id, e),
            },
            Op::GetSession { sub_id, session_id } => {
                match self.coordinator.get_session(&session_id) {
                    Ok(session) => Event::SessionSnapshot { sub_id, session },
                    Err(e) => Self::error_event(sub_id, e),
                }
            }
            Op::CheckAgents { sub_id } => Event::AgentHealth {
                sub_id,
                statuses: self.coordinator.agent_health().await,
            },
            Op::CancelSession { sub_id, session_id } => {
                match self.coordinator.cancel(&session_id) {
                    Ok(cancelled) => Event::SessionCancelled {
                        sub_id,
                        session_id,
                        cancelled,
                    },
                    Err(e) => Self::error_event(sub_id, e),
                }
            }
        };

        let _ = self.event_tx.send(event);
    }

    fn error_event(sub_id: SubmissionId, e: CoordinatorError) -> Event {
        Event::Error {
            sub_id,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Codebase, ErrorReport};
    use crate::protocol::SessionId;
    use crate::session::SessionStatus;

    #[test]
    fn test_channel_creation() {
        let (channel, _pair) = CoordinatorChannel::new();
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_send_op() {
        let (channel, mut pair) = CoordinatorChannel::new();

        let sub_id = channel.send(Op::check_agents()).unwrap();

        let received = pair.op_rx.try_recv().unwrap();
        assert_eq!(*received.sub_id(), sub_id);
    }

    #[test]
    fn test_send_after_service_dropped() {
        let (channel, pair) = CoordinatorChannel::new();
        drop(pair);
        assert!(matches!(
            channel.send(Op::check_agents()),
            Err(CoordinatorError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_service_round_trip() {
        let (service, channel) = DebugService::with_channel(AgentCoordinator::with_defaults());
        tokio::spawn(service.run());

        let health_sub = channel.send(Op::check_agents()).unwrap();
        match channel.recv().await {
            Some(Event::AgentHealth { sub_id, statuses }) => {
                assert_eq!(sub_id, health_sub);
                assert_eq!(statuses.len(), 4);
                assert!(statuses.values().all(|ok| *ok));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let error = ErrorReport::builder("TypeError", "unsupported operand")
            .file_path("calc.py")
            .line_number(7)
            .build()
            .unwrap();
        channel.send(Op::submit(error, Codebase::new("calc"))).unwrap();

        let result = loop {
            match channel.recv().await {
                Some(Event::SessionFinished { result }) => break result,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        };
        assert!(result.success);

        channel.send(Op::get_session(result.session_id.clone())).unwrap();
        match channel.recv().await {
            Some(Event::SessionSnapshot { session, .. }) => {
                assert_eq!(session.status(), SessionStatus::Completed);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_service_reports_unknown_session() {
        let (service, channel) = DebugService::with_channel(AgentCoordinator::with_defaults());
        tokio::spawn(service.run());

        channel.send(Op::get_session(SessionId::from("missing"))).unwrap();
        assert!(matches!(
            channel.recv().await,
            Some(Event::Error { message, .. }) if message.contains("missing")
        ));
    }
}
