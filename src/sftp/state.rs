//! The SFTP engine state machine: version negotiation, in-flight requests
//! and shutdown.

use super::{
    error::SftpError,
    wire::{Message, RequestId, SFTP_PROTOCOL_VERSION},
};
use crate::session::{fulfill, Promise};
use std::{collections::HashMap, mem};

pub(crate) type Reply = Promise<Result<Message, SftpError>>;
pub(crate) type Completion = Promise<Result<(), SftpError>>;
pub(crate) type Extensions = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpState {
    Idle,
    Starting,
    Ready,
    Closing,
    Closed,
    Failed(SftpError),
}

#[derive(Debug)]
pub(crate) enum SftpEvent {
    Start {
        extensions: Extensions,
        promise: Promise<Result<Extensions, SftpError>>,
    },
    RequestMessage(Message, Reply),
    Inbound(Message),
    /// The frame for this request could not be handed to the channel.
    MessageFailed(RequestId),
    /// The inbound byte stream could not be decoded.
    ProtocolError(SftpError),
    RequestDisconnection(Completion),
    Disconnected,
}

#[derive(Debug)]
pub(crate) enum SftpAction {
    None,
    Send(Message),
    Disconnect,
}

#[derive(Debug)]
enum State {
    Idle,
    SentVersion(Promise<Result<Extensions, SftpError>>),
    Ready(HashMap<RequestId, Reply>),
    Disconnecting {
        completions: Vec<Completion>,
        error: Option<SftpError>,
    },
    Disconnected,
    Failed(SftpError),
}

#[derive(Debug)]
pub(crate) struct SftpStateMachine {
    state: State,
}

impl SftpStateMachine {
    pub(crate) fn new() -> Self {
        Self { state: State::Idle }
    }

    pub(crate) fn state(&self) -> SftpState {
        match &self.state {
            State::Idle => SftpState::Idle,
            State::SentVersion(..) => SftpState::Starting,
            State::Ready(..) => SftpState::Ready,
            State::Disconnecting { .. } => SftpState::Closing,
            State::Disconnected => SftpState::Closed,
            State::Failed(err) => SftpState::Failed(err.clone()),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, State::Disconnected | State::Failed(..))
    }

    pub(crate) fn is_in_flight(&self, id: RequestId) -> bool {
        match &self.state {
            State::Ready(pending) => pending.contains_key(&id),
            _ => false,
        }
    }

    pub(crate) fn handle(&mut self, event: SftpEvent) -> SftpAction {
        let state = mem::replace(&mut self.state, State::Disconnected);
        let (state, action) = match (state, event) {
            (State::Idle, SftpEvent::Start { extensions, promise }) => (
                State::SentVersion(promise),
                SftpAction::Send(Message::Init {
                    version: SFTP_PROTOCOL_VERSION,
                    extensions,
                }),
            ),
            (state, SftpEvent::Start { promise, .. }) => {
                tracing::warn!(?state, "the SFTP engine was started twice");
                fulfill(promise, Err(SftpError::protocol("already started")));
                (state, SftpAction::None)
            }

            (State::SentVersion(promise), SftpEvent::Inbound(message)) => match message {
                Message::Version {
                    version: SFTP_PROTOCOL_VERSION,
                    extensions,
                } => {
                    fulfill(promise, Ok(extensions));
                    (State::Ready(HashMap::new()), SftpAction::None)
                }
                Message::Version { version, .. } => {
                    let err = SftpError::UnsupportedVersion(version);
                    fulfill(promise, Err(err.clone()));
                    disconnect(Some(err))
                }
                message => {
                    tracing::warn!(?message, "expected a version message");
                    let err = SftpError::protocol("expected a version message");
                    fulfill(promise, Err(err.clone()));
                    disconnect(Some(err))
                }
            },

            (State::Ready(mut pending), SftpEvent::RequestMessage(message, reply)) => {
                match message.request_id() {
                    Some(id) if pending.contains_key(&id) => {
                        fulfill(reply, Err(SftpError::protocol("request ID is already in flight")));
                        (State::Ready(pending), SftpAction::None)
                    }
                    Some(id) => {
                        pending.insert(id, reply);
                        (State::Ready(pending), SftpAction::Send(message))
                    }
                    None => {
                        fulfill(reply, Err(SftpError::protocol("not a request")));
                        (State::Ready(pending), SftpAction::None)
                    }
                }
            }
            (state, SftpEvent::RequestMessage(_, reply)) => {
                fulfill(reply, Err(SftpError::ConnectionClosed));
                (state, SftpAction::None)
            }

            (State::Ready(mut pending), SftpEvent::Inbound(message)) => {
                match message.request_id().and_then(|id| pending.remove(&id)) {
                    Some(reply) => {
                        fulfill(reply, Ok(message));
                        (State::Ready(pending), SftpAction::None)
                    }
                    None => {
                        tracing::warn!(?message, "response does not match any request");
                        drain(pending);
                        disconnect(Some(SftpError::protocol("response does not match any request")))
                    }
                }
            }

            (State::Ready(mut pending), SftpEvent::MessageFailed(id)) => {
                if let Some(reply) = pending.remove(&id) {
                    fulfill(reply, Err(SftpError::ConnectionClosed));
                }
                (State::Ready(pending), SftpAction::None)
            }

            (State::SentVersion(promise), SftpEvent::ProtocolError(err)) => {
                fulfill(promise, Err(err.clone()));
                disconnect(Some(err))
            }
            (State::Ready(pending), SftpEvent::ProtocolError(err)) => {
                tracing::warn!(?err, "malformed SFTP frame");
                drain(pending);
                disconnect(Some(err))
            }

            (State::Idle, SftpEvent::RequestDisconnection(completion)) => {
                disconnect_with(completion)
            }
            (State::SentVersion(promise), SftpEvent::RequestDisconnection(completion)) => {
                fulfill(promise, Err(SftpError::ConnectionClosed));
                disconnect_with(completion)
            }
            (State::Ready(pending), SftpEvent::RequestDisconnection(completion)) => {
                drain(pending);
                disconnect_with(completion)
            }
            (
                State::Disconnecting {
                    mut completions,
                    error,
                },
                SftpEvent::RequestDisconnection(completion),
            ) => {
                completions.push(completion);
                (State::Disconnecting { completions, error }, SftpAction::None)
            }
            (
                state @ (State::Disconnected | State::Failed(..)),
                SftpEvent::RequestDisconnection(completion),
            ) => {
                fulfill(completion, Ok(()));
                (state, SftpAction::None)
            }

            (State::Disconnecting { completions, error }, SftpEvent::Disconnected) => {
                for completion in completions {
                    fulfill(completion, Ok(()));
                }
                match error {
                    Some(err) => (State::Failed(err), SftpAction::None),
                    None => (State::Disconnected, SftpAction::None),
                }
            }
            (State::Idle, SftpEvent::Disconnected) => {
                (State::Failed(SftpError::ConnectionClosed), SftpAction::None)
            }
            (State::SentVersion(promise), SftpEvent::Disconnected) => {
                fulfill(promise, Err(SftpError::ConnectionClosed));
                (State::Failed(SftpError::ConnectionClosed), SftpAction::None)
            }
            (State::Ready(pending), SftpEvent::Disconnected) => {
                drain(pending);
                (State::Failed(SftpError::ConnectionClosed), SftpAction::None)
            }

            (state, event) => {
                tracing::trace!(?state, ?event, "ignoring SFTP event");
                (state, SftpAction::None)
            }
        };
        self.state = state;
        action
    }
}

fn drain(pending: HashMap<RequestId, Reply>) {
    for (_, reply) in pending {
        fulfill(reply, Err(SftpError::ConnectionClosed));
    }
}

fn disconnect(error: Option<SftpError>) -> (State, SftpAction) {
    (
        State::Disconnecting {
            completions: vec![],
            error,
        },
        SftpAction::Disconnect,
    )
}

fn disconnect_with(completion: Completion) -> (State, SftpAction) {
    (
        State::Disconnecting {
            completions: vec![completion],
            error: None,
        },
        SftpAction::Disconnect,
    )
}
