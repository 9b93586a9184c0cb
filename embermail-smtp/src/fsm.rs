//! SMTP Finite State Machine implementation.
//!
//! This module provides a proper implementation of the `FiniteStateMachine` trait
//! for SMTP protocol state management. It ensures pure, side-effect-free state
//! transitions using only protocol-level context.

use embermail_common::traits::fsm::FiniteStateMachine;

use crate::{command::Command, session_state::SessionState, state::State};

/// Implementation of the `FiniteStateMachine` trait for SMTP protocol states.
///
/// # Example
///
/// ```rust
/// use embermail_common::traits::fsm::FiniteStateMachine;
/// use embermail_smtp::{
///     command::{Command, HeloVariant},
///     session_state::SessionState,
///     state::State,
/// };
///
/// let mut session_state = SessionState::new();
/// let state = State::default(); // Connect state
///
/// let new_state = FiniteStateMachine::transition(
///     state,
///     Command::Helo(HeloVariant::Ehlo("client.example.com".to_string())),
///     &mut session_state,
/// );
///
/// assert_eq!(session_state.id(), "client.example.com");
/// assert!(session_state.is_extended());
/// ```
impl FiniteStateMachine for State {
    /// SMTP commands are the input to the FSM
    type Input = Command;

    /// Session state contains only FSM state (id, extended, envelope)
    type Context = SessionState;

    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self {
        self.transition_protocol(input, context)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use embermail_common::{address::Address, address_parser, traits::fsm::FiniteStateMachine};

    use super::*;
    use crate::command::HeloVariant;

    #[test]
    fn test_fsm_trait_ehlo_transition() {
        let mut session_state = SessionState::new();
        let state = State::default(); // Connect state

        let new_state = FiniteStateMachine::transition(
            state,
            Command::Helo(HeloVariant::Ehlo("client.example.com".to_string())),
            &mut session_state,
        );

        assert_eq!(session_state.id(), "client.example.com");
        assert!(session_state.is_extended());
        assert!(matches!(new_state, State::Ehlo(_)));
    }

    #[test]
    fn test_fsm_trait_helo_transition() {
        let mut session_state = SessionState::new();
        let state = State::default();

        let new_state = FiniteStateMachine::transition(
            state,
            Command::Helo(HeloVariant::Helo("client.example.com".to_string())),
            &mut session_state,
        );

        assert_eq!(session_state.id(), "client.example.com");
        assert!(!session_state.is_extended()); // HELO does not set extended
        assert!(matches!(new_state, State::Helo(_)));
    }

    #[test]
    fn test_fsm_trait_mail_transaction() {
        let mut session_state = SessionState::with_id("client.example.com".to_string(), true);

        let state = State::Ehlo(crate::state::Ehlo {
            id: "client.example.com".to_string(),
        });

        let sender_mailbox = address_parser::parse_forward_path("<sender@example.com>").unwrap();
        let sender = Address::from(
            mailparse::addrparse(&sender_mailbox.to_string())
                .unwrap()
                .remove(0),
        );
        let state = FiniteStateMachine::transition(
            state,
            Command::MailFrom {
                sender: Some(sender),
                params: embermail_common::envelope::MailParameters::default(),
            },
            &mut session_state,
        );

        assert!(matches!(state, State::MailFrom(_)));
        assert!(session_state.envelope().sender().is_some());
    }

    #[test]
    fn test_fsm_trait_quit_from_any_state() {
        let mut session_state = SessionState::new();

        let states = vec![
            State::default(),
            State::Ehlo(crate::state::Ehlo {
                id: "test".to_string(),
            }),
            State::Helo(crate::state::Helo {
                id: "test".to_string(),
            }),
        ];

        for state in states {
            let new_state =
                FiniteStateMachine::transition(state, Command::Quit, &mut session_state);
            assert!(matches!(new_state, State::Quit(_)));
        }
    }

    #[test]
    fn test_fsm_trait_rset_clears_envelope() {
        let mut session_state = SessionState::with_id("client.example.com".to_string(), true);

        let sender_mailbox = address_parser::parse_forward_path("<sender@example.com>").unwrap();
        let sender = Address::from(
            mailparse::addrparse(&sender_mailbox.to_string())
                .unwrap()
                .remove(0),
        );
        *session_state.envelope_mut().sender_mut() = Some(sender);

        let state = State::Ehlo(crate::state::Ehlo {
            id: "client.example.com".to_string(),
        });

        let new_state = FiniteStateMachine::transition(state, Command::Rset, &mut session_state);

        assert!(matches!(new_state, State::Ehlo(_)));
        assert!(session_state.envelope().sender().is_none());
    }

    #[test]
    fn test_fsm_trait_polymorphic_usage() {
        fn run_fsm<F: FiniteStateMachine<Input = Command, Context = SessionState>>(
            fsm: F,
            input: Command,
            ctx: &mut SessionState,
        ) -> F {
            fsm.transition(input, ctx)
        }

        let mut session_state = SessionState::new();
        let state = State::default();

        let new_state = run_fsm(
            state,
            Command::Helo(HeloVariant::Ehlo("client.example.com".to_string())),
            &mut session_state,
        );

        assert!(matches!(new_state, State::Ehlo(_)));
        assert_eq!(session_state.id(), "client.example.com");
    }
}
