use crate::{
    error::ConnectionError,
    session::{fulfill, Promise, Session, StartingTask},
    transport::TransportLink,
};
use std::{fmt, mem, sync::Arc, time::Duration};

pub(crate) type AttemptId = u64;

type Completion = Promise<Result<(), ConnectionError>>;

/// The observable lifecycle of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Ready,
    Disconnecting,
    Failed(ConnectionError),
}

pub(crate) struct SessionRequest {
    pub(crate) session: Box<dyn Session>,
    pub(crate) timeout: Duration,
    pub(crate) promise: Completion,
    pub(crate) task: Option<StartingTask>,
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    RequestConnection(Duration, Completion),
    RequestDisconnection(Completion),
    RequestSession(SessionRequest),
    Connected(AttemptId, Arc<dyn TransportLink>),
    Authenticated(AttemptId),
    Disconnected(AttemptId),
    Error(AttemptId, ConnectionError),
}

#[derive(Debug)]
pub(crate) enum ConnectionAction {
    None,
    Connect(AttemptId, Duration),
    Disconnect(Arc<dyn TransportLink>),
    /// A link produced by an attempt nobody waits for anymore.
    Discard(Arc<dyn TransportLink>),
    StartSession(Arc<dyn TransportLink>, SessionRequest),
}

#[derive(Debug)]
enum State {
    Idle,
    Connecting {
        attempt: AttemptId,
        connects: Vec<Completion>,
    },
    Authenticating {
        attempt: AttemptId,
        link: Arc<dyn TransportLink>,
        connects: Vec<Completion>,
    },
    Ready {
        attempt: AttemptId,
        link: Arc<dyn TransportLink>,
    },
    Disconnecting {
        attempt: AttemptId,
        link: Arc<dyn TransportLink>,
        connects: Vec<Completion>,
        disconnects: Vec<Completion>,
        error: Option<ConnectionError>,
    },
    Failed(ConnectionError),
}

fn complete_all(promises: Vec<Completion>, result: Result<(), ConnectionError>) {
    for promise in promises {
        fulfill(promise, result.clone());
    }
}

/// Arbitrates concurrent start, stop and session requests against a single
/// transport link. Completions are resolved inline; side effects on the
/// transport are returned as actions.
#[derive(Debug)]
pub(crate) struct ConnectionStateMachine {
    state: State,
    next_attempt: AttemptId,
}

impl ConnectionStateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            next_attempt: 0,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match &self.state {
            State::Idle => ConnectionState::Idle,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Authenticating { .. } => ConnectionState::Authenticating,
            State::Ready { .. } => ConnectionState::Ready,
            State::Disconnecting { .. } => ConnectionState::Disconnecting,
            State::Failed(err) => ConnectionState::Failed(err.clone()),
        }
    }

    /// The link currently owned by the connection, if any.
    pub(crate) fn link(&self) -> Option<&Arc<dyn TransportLink>> {
        match &self.state {
            State::Authenticating { link, .. }
            | State::Ready { link, .. }
            | State::Disconnecting { link, .. } => Some(link),
            _ => None,
        }
    }

    fn current_attempt(&self) -> Option<AttemptId> {
        match &self.state {
            State::Connecting { attempt, .. }
            | State::Authenticating { attempt, .. }
            | State::Ready { attempt, .. }
            | State::Disconnecting { attempt, .. } => Some(*attempt),
            State::Idle | State::Failed(..) => None,
        }
    }

    pub(crate) fn handle(&mut self, event: ConnectionEvent) -> ConnectionAction {
        // events from an abandoned attempt never touch the current state
        match event {
            ConnectionEvent::Connected(attempt, link)
                if self.current_attempt() != Some(attempt) =>
            {
                tracing::debug!(attempt, "discarding link of a stale attempt");
                return ConnectionAction::Discard(link);
            }
            ConnectionEvent::Authenticated(attempt)
            | ConnectionEvent::Disconnected(attempt)
            | ConnectionEvent::Error(attempt, ..)
                if self.current_attempt() != Some(attempt) =>
            {
                tracing::trace!(attempt, "ignoring event of a stale attempt");
                return ConnectionAction::None;
            }
            event => self.handle_current(event),
        }
    }

    fn start_attempt(&mut self, timeout: Duration, promise: Completion) -> ConnectionAction {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.state = State::Connecting {
            attempt,
            connects: vec![promise],
        };
        ConnectionAction::Connect(attempt, timeout)
    }

    fn handle_current(&mut self, event: ConnectionEvent) -> ConnectionAction {
        match (mem::replace(&mut self.state, State::Idle), event) {
            // ==== Idle / Failed ====
            (State::Idle, ConnectionEvent::RequestConnection(timeout, promise))
            | (State::Failed(..), ConnectionEvent::RequestConnection(timeout, promise)) => {
                self.start_attempt(timeout, promise)
            }
            (state @ State::Idle, ConnectionEvent::RequestDisconnection(promise))
            | (state @ State::Failed(..), ConnectionEvent::RequestDisconnection(promise)) => {
                self.state = state;
                fulfill(promise, Ok(()));
                ConnectionAction::None
            }

            // ==== Connecting ====
            (State::Connecting { attempt, mut connects }, ConnectionEvent::RequestConnection(_, promise)) => {
                connects.push(promise);
                self.state = State::Connecting { attempt, connects };
                ConnectionAction::None
            }
            (State::Connecting { attempt, connects }, ConnectionEvent::Connected(_, link)) => {
                self.state = State::Authenticating {
                    attempt,
                    link,
                    connects,
                };
                ConnectionAction::None
            }
            (State::Connecting { connects, .. }, ConnectionEvent::Error(_, err)) => {
                complete_all(connects, Err(err.clone()));
                self.state = State::Failed(err);
                ConnectionAction::None
            }
            (State::Connecting { connects, .. }, ConnectionEvent::RequestDisconnection(promise)) => {
                // the link of this attempt, if it ever shows up, is discarded as stale
                complete_all(connects, Err(ConnectionError::Cancelled));
                fulfill(promise, Ok(()));
                ConnectionAction::None
            }

            // ==== Authenticating ====
            (State::Authenticating { attempt, link, mut connects }, ConnectionEvent::RequestConnection(_, promise)) => {
                connects.push(promise);
                self.state = State::Authenticating {
                    attempt,
                    link,
                    connects,
                };
                ConnectionAction::None
            }
            (State::Authenticating { attempt, link, connects }, ConnectionEvent::Authenticated(_)) => {
                complete_all(connects, Ok(()));
                self.state = State::Ready { attempt, link };
                ConnectionAction::None
            }
            (State::Authenticating { attempt, link, connects }, ConnectionEvent::Error(_, err)) => {
                self.state = State::Disconnecting {
                    attempt,
                    link: link.clone(),
                    connects,
                    disconnects: vec![],
                    error: Some(err),
                };
                ConnectionAction::Disconnect(link)
            }
            (State::Authenticating { attempt, link, connects }, ConnectionEvent::RequestDisconnection(promise)) => {
                complete_all(connects, Err(ConnectionError::Cancelled));
                self.state = State::Disconnecting {
                    attempt,
                    link: link.clone(),
                    connects: vec![],
                    disconnects: vec![promise],
                    error: None,
                };
                ConnectionAction::Disconnect(link)
            }
            (State::Authenticating { connects, .. }, ConnectionEvent::Disconnected(_)) => {
                complete_all(connects, Err(ConnectionError::Unknown));
                self.state = State::Failed(ConnectionError::Unknown);
                ConnectionAction::None
            }

            // ==== Ready ====
            (state @ State::Ready { .. }, ConnectionEvent::RequestConnection(_, promise)) => {
                self.state = state;
                fulfill(promise, Ok(()));
                ConnectionAction::None
            }
            (State::Ready { attempt, link }, ConnectionEvent::RequestSession(request)) => {
                self.state = State::Ready {
                    attempt,
                    link: link.clone(),
                };
                ConnectionAction::StartSession(link, request)
            }
            (State::Ready { attempt, link }, ConnectionEvent::RequestDisconnection(promise)) => {
                self.state = State::Disconnecting {
                    attempt,
                    link: link.clone(),
                    connects: vec![],
                    disconnects: vec![promise],
                    error: None,
                };
                ConnectionAction::Disconnect(link)
            }
            (State::Ready { attempt, link }, ConnectionEvent::Error(_, err)) => {
                self.state = State::Disconnecting {
                    attempt,
                    link: link.clone(),
                    connects: vec![],
                    disconnects: vec![],
                    error: Some(err),
                };
                ConnectionAction::Disconnect(link)
            }
            (State::Ready { .. }, ConnectionEvent::Disconnected(_)) => {
                self.state = State::Failed(ConnectionError::ConnectionClosed);
                ConnectionAction::None
            }

            // ==== Disconnecting ====
            (state @ State::Disconnecting { .. }, ConnectionEvent::RequestConnection(_, promise)) => {
                self.state = state;
                fulfill(promise, Err(ConnectionError::RequireActiveConnection));
                ConnectionAction::None
            }
            (State::Disconnecting { attempt, link, connects, mut disconnects, error }, ConnectionEvent::RequestDisconnection(promise)) => {
                disconnects.push(promise);
                self.state = State::Disconnecting {
                    attempt,
                    link,
                    connects,
                    disconnects,
                    error,
                };
                ConnectionAction::None
            }
            (State::Disconnecting { attempt, link, connects, disconnects, error }, ConnectionEvent::Error(_, err)) => {
                self.state = State::Disconnecting {
                    attempt,
                    link,
                    connects,
                    disconnects,
                    error: error.or(Some(err)),
                };
                ConnectionAction::None
            }
            (State::Disconnecting { connects, disconnects, error, .. }, ConnectionEvent::Disconnected(_)) => {
                complete_all(disconnects, Ok(()));
                match error {
                    Some(err) => {
                        complete_all(connects, Err(err.clone()));
                        self.state = State::Failed(err);
                    }
                    None => {
                        complete_all(connects, Err(ConnectionError::Cancelled));
                        self.state = State::Idle;
                    }
                }
                ConnectionAction::None
            }

            // ==== sessions outside Ready ====
            (state, ConnectionEvent::RequestSession(request)) => {
                self.state = state;
                fulfill(request.promise, Err(ConnectionError::RequireActiveConnection));
                ConnectionAction::None
            }

            // authentication finished after the teardown was requested
            (state @ State::Disconnecting { .. }, ConnectionEvent::Authenticated(_)) => {
                self.state = state;
                ConnectionAction::None
            }

            (state, event) => {
                tracing::warn!(?state, ?event, "unexpected connection event");
                self.state = state;
                ConnectionAction::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Channel, TransportError};
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    struct NullLink;

    #[async_trait]
    impl TransportLink for NullLink {
        async fn authenticate(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn open_channel(&self) -> Result<Channel, TransportError> {
            Ok(Channel::pair().0)
        }
        fn close(&self) {}
        async fn closed(&self) {}
    }

    fn link() -> Arc<dyn TransportLink> {
        Arc::new(NullLink)
    }

    fn promise() -> (Completion, oneshot::Receiver<Result<(), ConnectionError>>) {
        oneshot::channel()
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn connect(machine: &mut ConnectionStateMachine) -> (AttemptId, oneshot::Receiver<Result<(), ConnectionError>>) {
        let (tx, rx) = promise();
        match machine.handle(ConnectionEvent::RequestConnection(TIMEOUT, tx)) {
            ConnectionAction::Connect(attempt, timeout) => {
                assert_eq!(timeout, TIMEOUT);
                (attempt, rx)
            }
            action => panic!("unexpected action: {:?}", action),
        }
    }

    fn ready(machine: &mut ConnectionStateMachine) -> AttemptId {
        let (attempt, mut rx) = connect(machine);
        machine.handle(ConnectionEvent::Connected(attempt, link()));
        machine.handle(ConnectionEvent::Authenticated(attempt));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        attempt
    }

    #[test]
    fn concurrent_connects_share_one_attempt() {
        let mut machine = ConnectionStateMachine::new();
        let (attempt, mut first) = connect(&mut machine);

        let (tx, mut second) = promise();
        assert!(matches!(
            machine.handle(ConnectionEvent::RequestConnection(TIMEOUT, tx)),
            ConnectionAction::None
        ));

        machine.handle(ConnectionEvent::Connected(attempt, link()));
        assert_eq!(machine.state(), ConnectionState::Authenticating);
        machine.handle(ConnectionEvent::Authenticated(attempt));

        assert_eq!(machine.state(), ConnectionState::Ready);
        assert_eq!(first.try_recv().unwrap(), Ok(()));
        assert_eq!(second.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn connect_when_ready_succeeds_immediately() {
        let mut machine = ConnectionStateMachine::new();
        ready(&mut machine);

        let (tx, mut rx) = promise();
        assert!(matches!(
            machine.handle(ConnectionEvent::RequestConnection(TIMEOUT, tx)),
            ConnectionAction::None
        ));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn disconnect_from_idle_and_failed_succeeds() {
        let mut machine = ConnectionStateMachine::new();
        let (tx, mut rx) = promise();
        machine.handle(ConnectionEvent::RequestDisconnection(tx));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(machine.state(), ConnectionState::Idle);

        let (attempt, mut connect_rx) = connect(&mut machine);
        machine.handle(ConnectionEvent::Error(attempt, ConnectionError::Timeout));
        assert_eq!(connect_rx.try_recv().unwrap(), Err(ConnectionError::Timeout));

        let (tx, mut rx) = promise();
        machine.handle(ConnectionEvent::RequestDisconnection(tx));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(
            machine.state(),
            ConnectionState::Failed(ConnectionError::Timeout)
        );
    }

    #[test]
    fn disconnect_while_connecting_cancels_and_discards_late_link() {
        let mut machine = ConnectionStateMachine::new();
        let (attempt, mut connect_rx) = connect(&mut machine);

        let (tx, mut rx) = promise();
        machine.handle(ConnectionEvent::RequestDisconnection(tx));
        assert_eq!(machine.state(), ConnectionState::Idle);
        assert_eq!(connect_rx.try_recv().unwrap(), Err(ConnectionError::Cancelled));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));

        assert!(matches!(
            machine.handle(ConnectionEvent::Connected(attempt, link())),
            ConnectionAction::Discard(..)
        ));
        assert_eq!(machine.state(), ConnectionState::Idle);
    }

    #[test]
    fn disconnect_while_authenticating_cancels_pending_connects() {
        let mut machine = ConnectionStateMachine::new();
        let (attempt, mut connect_rx) = connect(&mut machine);
        machine.handle(ConnectionEvent::Connected(attempt, link()));

        let (tx, mut rx) = promise();
        assert!(matches!(
            machine.handle(ConnectionEvent::RequestDisconnection(tx)),
            ConnectionAction::Disconnect(..)
        ));
        assert_eq!(connect_rx.try_recv().unwrap(), Err(ConnectionError::Cancelled));
        assert_eq!(machine.state(), ConnectionState::Disconnecting);

        machine.handle(ConnectionEvent::Disconnected(attempt));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(machine.state(), ConnectionState::Idle);
    }

    #[test]
    fn concurrent_disconnects_join() {
        let mut machine = ConnectionStateMachine::new();
        let attempt = ready(&mut machine);

        let (tx1, mut rx1) = promise();
        let (tx2, mut rx2) = promise();
        assert!(matches!(
            machine.handle(ConnectionEvent::RequestDisconnection(tx1)),
            ConnectionAction::Disconnect(..)
        ));
        assert!(matches!(
            machine.handle(ConnectionEvent::RequestDisconnection(tx2)),
            ConnectionAction::None
        ));
        assert!(rx1.try_recv().is_err());

        machine.handle(ConnectionEvent::Disconnected(attempt));
        assert_eq!(rx1.try_recv().unwrap(), Ok(()));
        assert_eq!(rx2.try_recv().unwrap(), Ok(()));
        assert_eq!(machine.state(), ConnectionState::Idle);
    }

    #[test]
    fn connect_while_disconnecting_is_rejected() {
        let mut machine = ConnectionStateMachine::new();
        ready(&mut machine);
        let (tx, _rx) = promise();
        machine.handle(ConnectionEvent::RequestDisconnection(tx));

        let (tx, mut rx) = promise();
        machine.handle(ConnectionEvent::RequestConnection(TIMEOUT, tx));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ConnectionError::RequireActiveConnection)
        );
    }

    #[test]
    fn authentication_error_fails_after_teardown() {
        let mut machine = ConnectionStateMachine::new();
        let (attempt, mut connect_rx) = connect(&mut machine);
        machine.handle(ConnectionEvent::Connected(attempt, link()));

        let err = ConnectionError::Transport(TransportError::new(
            crate::transport::TransportErrorKind::AuthenticationFailed,
            "denied",
        ));
        assert!(matches!(
            machine.handle(ConnectionEvent::Error(attempt, err.clone())),
            ConnectionAction::Disconnect(..)
        ));
        assert!(connect_rx.try_recv().is_err());

        machine.handle(ConnectionEvent::Disconnected(attempt));
        assert_eq!(connect_rx.try_recv().unwrap(), Err(err.clone()));
        assert_eq!(machine.state(), ConnectionState::Failed(err));
    }

    #[test]
    fn unsolicited_drop_while_ready_fails() {
        let mut machine = ConnectionStateMachine::new();
        let attempt = ready(&mut machine);

        machine.handle(ConnectionEvent::Disconnected(attempt));
        assert_eq!(
            machine.state(),
            ConnectionState::Failed(ConnectionError::ConnectionClosed)
        );

        // reconnecting starts a fresh attempt
        let (next, _rx) = connect(&mut machine);
        assert_ne!(next, attempt);
    }

    #[test]
    fn drop_while_authenticating_is_unknown_failure() {
        let mut machine = ConnectionStateMachine::new();
        let (attempt, mut connect_rx) = connect(&mut machine);
        machine.handle(ConnectionEvent::Connected(attempt, link()));
        machine.handle(ConnectionEvent::Disconnected(attempt));

        assert_eq!(connect_rx.try_recv().unwrap(), Err(ConnectionError::Unknown));
        assert_eq!(
            machine.state(),
            ConnectionState::Failed(ConnectionError::Unknown)
        );
    }

    struct NopSession;

    impl Session for NopSession {
        fn start(self: Box<Self>, _: crate::session::SessionContext) {}
    }

    fn session_request() -> (SessionRequest, oneshot::Receiver<Result<(), ConnectionError>>) {
        let (tx, rx) = promise();
        (
            SessionRequest {
                session: Box::new(NopSession),
                timeout: TIMEOUT,
                promise: tx,
                task: None,
            },
            rx,
        )
    }

    #[test]
    fn sessions_require_ready() {
        let mut machine = ConnectionStateMachine::new();
        let (request, mut rx) = session_request();
        assert!(matches!(
            machine.handle(ConnectionEvent::RequestSession(request)),
            ConnectionAction::None
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ConnectionError::RequireActiveConnection)
        );

        ready(&mut machine);
        let (request, _rx) = session_request();
        assert!(matches!(
            machine.handle(ConnectionEvent::RequestSession(request)),
            ConnectionAction::StartSession(..)
        ));
    }
}
