//! Command dispatch: turns a parsed [`Command`] into FSM transitions, SPI
//! calls, and wire responses.

use embermail_common::{context::Context, envelope::RecipientEntry, error::SessionError, internal, status::Status, tracing};
use embermail_tracing::traced;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use crate::{
    auth::{decode_login_field, decode_response, parse_plain, AuthError},
    command::{AuthMechanism, Command},
    error::CommandError,
    framer::{Frame, Framer},
    spi::{InterceptorSnapshot, InterceptorStage, Verdict},
    state::State,
};

use super::Session;

/// Capacity of the channel feeding body bytes to a spawned
/// `TransactionProcessor::data` task. Small enough to provide backpressure
/// against a slow processor without stalling the wire reader on every chunk.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Per-transaction recipient cap (RFC 5321 §4.5.3.1.10 recommends bounding
/// this rather than accepting an unbounded envelope).
const MAX_RECIPIENTS: usize = 100;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    fn snapshot<'a>(&self, ctx: &'a Context, sender: Option<&'a str>) -> InterceptorSnapshot<'a> {
        InterceptorSnapshot {
            peer: self.peer,
            client_id: ctx.id(),
            authenticated_as: ctx.authenticated_as.as_deref(),
            tls_active: ctx.tls_active,
            sender,
            recipient_count: ctx.envelope.recipient_count(),
        }
    }

    /// Checks whether `command` is legal from the current state without
    /// committing anything: runs the FSM transition against a scratch clone
    /// of the session context, returning the candidate state and the
    /// mutated clone. Callers commit both only once every other check
    /// (interceptor, transaction processor) has also passed.
    fn try_transition(&self, command: Command) -> Result<(Context, State), CommandError> {
        let mut scratch = self.ctx.clone();
        let candidate = self.state.clone().transition(command, &mut scratch);
        if let State::Invalid(invalid) = &candidate {
            return Err(CommandError::sequence(invalid.reason.clone()));
        }
        Ok((scratch, candidate))
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip(self), ret), timing)]
    pub(super) async fn dispatch(&mut self, command: Command) -> Result<bool, SessionError> {
        let pre_ctx = self.ctx.clone();
        let pre_sender = pre_ctx.envelope.sender().map(ToString::to_string);
        let pre_snapshot = self.snapshot(&pre_ctx, pre_sender.as_deref());
        match self
            .interceptor
            .intercept(InterceptorStage::PreCommand, &command, pre_snapshot)
            .await
        {
            Verdict::Proceed => {}
            Verdict::Deny(status, message) => {
                return self.send_error(CommandError::new(status, message)).await;
            }
            Verdict::Drop(status, message) => {
                return Ok(self.send_error(CommandError::new(status, message).closing()).await?);
            }
        }

        match command {
            Command::Helo(variant) => self.handle_helo(variant).await,
            Command::Help => self.handle_help().await,
            Command::StartTLS => self.handle_starttls().await,
            Command::Auth {
                mechanism,
                initial_response,
            } => self.handle_auth(mechanism, initial_response).await,
            Command::MailFrom { sender, params } => self.handle_mail_from(sender, params).await,
            Command::RcptTo { recipients } => self.handle_rcpt_to(recipients).await,
            Command::Data => self.handle_data().await,
            Command::Bdat { size, last } => self.handle_bdat(size, last).await,
            Command::Rset => self.handle_rset().await,
            Command::Quit => self.handle_quit().await,
            Command::Noop => {
                self.send_line(Status::Ok, "Ok").await?;
                Ok(false)
            }
            Command::Vrfy(term) => self.handle_vrfy(term).await,
            Command::Expn(name) => self.handle_expn(name).await,
            Command::Etrn(domain) => self.handle_etrn(domain).await,
            Command::Invalid(reason) => {
                let close = self.send_error(CommandError::syntax(reason)).await?;
                Ok(close)
            }
        }
    }

    async fn handle_helo(&mut self, variant: crate::command::HeloVariant) -> Result<bool, SessionError> {
        use crate::command::HeloVariant;
        let client_id = match &variant {
            HeloVariant::Ehlo(id) | HeloVariant::Helo(id) => id.clone(),
        };
        let extended = matches!(variant, HeloVariant::Ehlo(_));
        match self.try_transition(Command::Helo(variant)) {
            Ok((ctx, candidate)) => {
                self.ctx = ctx;
                self.state = candidate;
                self.greet_required = false;
                if extended {
                    self.send_ehlo_response(&client_id).await?;
                } else {
                    self.send_helo_response(&client_id).await?;
                }
                Ok(false)
            }
            Err(err) => Ok(self.send_error(err).await?),
        }
    }

    /// HELP has no generalized transition arm outside EHLO/HELO, but every
    /// real client expects it to work from any state, so it is answered
    /// directly without touching the FSM.
    async fn handle_help(&mut self) -> Result<bool, SessionError> {
        self.send_line(Status::HelpMessage, "See RFC 5321 section 4.1 for supported commands")
            .await?;
        Ok(false)
    }

    async fn handle_starttls(&mut self) -> Result<bool, SessionError> {
        let Some(tls_context) = self.tls_context.clone() else {
            self.send_line(Status::NotImplemented, "TLS not available").await?;
            return Ok(false);
        };
        if self.ctx.tls_active {
            return Ok(self
                .send_error(CommandError::sequence("TLS is already active"))
                .await?);
        }

        let (ctx, candidate) = match self.try_transition(Command::StartTLS) {
            Ok(pair) => pair,
            Err(err) => return Ok(self.send_error(err).await?),
        };

        if self.framer_mut().has_buffered_input() {
            return Ok(self
                .send_error(
                    CommandError::syntax("pipelined data ahead of STARTTLS is not permitted").closing(),
                )
                .await?);
        }

        self.ctx = ctx;
        self.state = candidate;
        self.send_line(Status::ServiceReady, "Ready to begin TLS").await?;

        let connection = self
            .framer
            .take()
            .expect("framer is present outside an in-progress upgrade")
            .into_connection();
        let (upgraded, tls_info) = match connection.upgrade(&tls_context).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(peer = ?self.peer, error = %err, "TLS handshake failed");
                return Ok(true);
            }
        };

        self.framer = Some(Framer::new(upgraded));
        self.ctx.tls_active = true;
        self.ctx.envelope = embermail_common::envelope::Envelope::default();
        self.ctx.authenticated_as = None;
        self.ctx
            .metadata
            .insert("tls.protocol".to_string(), tls_info.proto());
        self.ctx.metadata.insert("tls.cipher".to_string(), tls_info.cipher());
        self.state = State::default();
        self.greet_required = true;
        internal!("TLS handshake complete for {}", self.peer);
        Ok(false)
    }

    async fn handle_auth(
        &mut self,
        mechanism: AuthMechanism,
        initial_response: Option<String>,
    ) -> Result<bool, SessionError> {
        let (ctx, candidate) = match self.try_transition(Command::Auth {
            mechanism,
            initial_response: initial_response.clone(),
        }) {
            Ok(pair) => pair,
            Err(err) => return Ok(self.send_error(err).await?),
        };

        if !self.auth_service.enabled() {
            self.send_line(Status::NotImplemented, "AUTH not available").await?;
            return Ok(false);
        }
        if !self.advertises_mechanism(mechanism) {
            return Ok(self
                .send_error(CommandError::sequence(format!("{mechanism} is not offered")))
                .await?);
        }
        if !self.ctx.tls_active {
            return Ok(self
                .send_error(CommandError::new(
                    Status::AuthRequired,
                    "AUTH requires an active TLS session",
                ))
                .await?);
        }

        let (user, pass) = match self.collect_credentials(mechanism, initial_response).await? {
            None => {
                return Ok(self
                    .send_error(CommandError::new(Status::SyntaxError, "authentication cancelled"))
                    .await?);
            }
            Some(creds) => creds,
        };

        let key = format!("{}:{user}", self.peer.ip());
        if let Some(remaining) = self.auth_rate_limiter.check_lock(&key).await {
            return Ok(self
                .send_error(CommandError::new(
                    Status::AuthRequired,
                    format!("too many failed attempts, retry in {}s", remaining.as_secs()),
                ))
                .await?);
        }

        if self.auth_service.verify(&user, &pass).await {
            self.auth_rate_limiter.record_success(&key).await;
            self.ctx = ctx;
            self.ctx.authenticated_as = Some(user);
            self.state = candidate;
            self.send_line(Status::AuthSuccessful, "Authentication successful").await?;
        } else {
            self.auth_rate_limiter.record_failure(&key).await;
            self.send_line(Status::AuthCredentialsInvalid, "Authentication credentials invalid")
                .await?;
        }
        Ok(false)
    }

    /// Runs the PLAIN/LOGIN credential exchange over the raw connection,
    /// bypassing the line-framer's command path since AUTH challenge and
    /// response lines are not themselves `Command`s.
    async fn collect_credentials(
        &mut self,
        mechanism: AuthMechanism,
        initial_response: Option<String>,
    ) -> Result<Option<(String, String)>, SessionError> {
        match mechanism {
            AuthMechanism::Plain => {
                let response = match initial_response {
                    Some(response) => response,
                    None => {
                        self.send_auth_challenge("").await?;
                        self.read_auth_line().await?
                    }
                };
                match decode_response(&response).and_then(|decoded| parse_plain(&decoded)) {
                    Ok(credentials) => Ok(Some((credentials.username, credentials.password))),
                    Err(AuthError::Cancelled) => Ok(None),
                    Err(err) => {
                        self.send_line(Status::SyntaxErrorInParameters, err.to_string()).await?;
                        Ok(None)
                    }
                }
            }
            AuthMechanism::Login => {
                let username_b64 = match initial_response {
                    Some(response) => response,
                    None => {
                        self.send_auth_challenge("VXNlcm5hbWU6").await?;
                        self.read_auth_line().await?
                    }
                };
                let username = match decode_login_field(&username_b64) {
                    Ok(u) => u,
                    Err(AuthError::Cancelled) => return Ok(None),
                    Err(err) => {
                        self.send_line(Status::SyntaxErrorInParameters, err.to_string()).await?;
                        return Ok(None);
                    }
                };
                self.send_auth_challenge("UGFzc3dvcmQ6").await?;
                let password_b64 = self.read_auth_line().await?;
                let password = match decode_login_field(&password_b64) {
                    Ok(p) => p,
                    Err(AuthError::Cancelled) => return Ok(None),
                    Err(err) => {
                        self.send_line(Status::SyntaxErrorInParameters, err.to_string()).await?;
                        return Ok(None);
                    }
                };
                Ok(Some((username, password)))
            }
        }
    }

    async fn read_auth_line(&mut self) -> Result<String, SessionError> {
        match self
            .framer_mut()
            .next_frame()
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?
        {
            Frame::Line(line) => Ok(String::from_utf8_lossy(&line).into_owned()),
            Frame::Eof => Err(SessionError::Protocol("connection closed mid-auth".to_string())),
            Frame::Bytes(_) => Err(SessionError::Protocol("unexpected byte frame during auth".to_string())),
        }
    }

    async fn handle_mail_from(
        &mut self,
        sender: Option<embermail_common::address::Address>,
        params: embermail_common::envelope::MailParameters,
    ) -> Result<bool, SessionError> {
        if self.auth_service.required_for_mail()
            && (!self.ctx.tls_active || self.ctx.authenticated_as.is_none())
        {
            return Ok(self
                .send_error(CommandError::new(
                    Status::AuthRequired,
                    "TLS and authentication are required before MAIL FROM",
                ))
                .await?);
        }

        if let Some(declared) = params.size {
            if self.max_message_size > 0 && declared > self.max_message_size {
                return Ok(self
                    .send_error(CommandError::quota(
                        Status::ExceededStorage,
                        format!("message size {declared} exceeds maximum of {}", self.max_message_size),
                    ))
                    .await?);
            }
        }

        let (mut ctx, candidate) = match self.try_transition(Command::MailFrom {
            sender: sender.clone(),
            params: params.clone(),
        }) {
            Ok(pair) => pair,
            Err(err) => return Ok(self.send_error(err).await?),
        };

        let sender_text = sender.as_ref().map(ToString::to_string);
        let snapshot = self.snapshot(&ctx, sender_text.as_deref());
        match self
            .interceptor
            .intercept(
                InterceptorStage::PostMailFrom,
                &Command::MailFrom {
                    sender: sender.clone(),
                    params: params.clone(),
                },
                snapshot,
            )
            .await
        {
            Verdict::Proceed => {}
            Verdict::Deny(status, message) => {
                return self.send_error(CommandError::new(status, message)).await;
            }
            Verdict::Drop(status, message) => {
                return Ok(self.send_error(CommandError::new(status, message).closing()).await?);
            }
        }

        if let Err(err) = self.processor.from(&mut ctx, sender.as_ref(), &params).await {
            return Ok(self.send_error(err).await?);
        }

        self.ctx = ctx;
        self.state = candidate;
        self.send_line(Status::Ok, "Ok").await?;
        Ok(false)
    }

    async fn handle_rcpt_to(
        &mut self,
        recipients: Vec<(
            embermail_common::address::Address,
            embermail_common::envelope::NotifyFlags,
            Option<String>,
        )>,
    ) -> Result<bool, SessionError> {
        if self.ctx.envelope.recipient_count() + recipients.len() > MAX_RECIPIENTS {
            return Ok(self
                .send_error(CommandError::too_many_recipients(format!(
                    "too many recipients, max {MAX_RECIPIENTS} per transaction"
                )))
                .await?);
        }

        let (mut ctx, candidate) = match self.try_transition(Command::RcptTo {
            recipients: recipients.clone(),
        }) {
            Ok(pair) => pair,
            Err(err) => return Ok(self.send_error(err).await?),
        };

        let sender_text = self.ctx.envelope.sender().map(ToString::to_string);
        let snapshot = self.snapshot(&ctx, sender_text.as_deref());
        match self
            .interceptor
            .intercept(
                InterceptorStage::PostRcptTo,
                &Command::RcptTo {
                    recipients: recipients.clone(),
                },
                snapshot,
            )
            .await
        {
            Verdict::Proceed => {}
            Verdict::Deny(status, message) => {
                return self.send_error(CommandError::new(status, message)).await;
            }
            Verdict::Drop(status, message) => {
                return Ok(self.send_error(CommandError::new(status, message).closing()).await?);
            }
        }

        for (address, notify, orcpt) in &recipients {
            let entry = RecipientEntry {
                address: address.clone(),
                notify: *notify,
                orcpt: orcpt.clone(),
            };
            if let Err(err) = self.processor.to(&mut ctx, &entry).await {
                return Ok(self.send_error(err).await?);
            }
        }

        self.ctx = ctx;
        self.state = candidate;
        self.send_line(Status::Ok, "Ok").await?;
        Ok(false)
    }

    async fn handle_data(&mut self) -> Result<bool, SessionError> {
        let pre_ctx = self.ctx.clone();
        let sender_text = pre_ctx.envelope.sender().map(ToString::to_string);
        let snapshot = self.snapshot(&pre_ctx, sender_text.as_deref());
        match self
            .interceptor
            .intercept(InterceptorStage::PreData, &Command::Data, snapshot)
            .await
        {
            Verdict::Proceed => {}
            Verdict::Deny(status, message) => {
                return self.send_error(CommandError::new(status, message)).await;
            }
            Verdict::Drop(status, message) => {
                return Ok(self.send_error(CommandError::new(status, message).closing()).await?);
            }
        }

        if !self.connection_rate_limiter.admit_message(self.peer.ip()).await {
            return Ok(self
                .send_error(CommandError::transient_local(
                    "message rate limit exceeded, try again later",
                ))
                .await?);
        }

        let (ctx, candidate) = match self.try_transition(Command::Data) {
            Ok(pair) => pair,
            Err(err) => return Ok(self.send_error(err).await?),
        };
        self.ctx = ctx;
        self.state = candidate;
        self.send_line(Status::StartMailInput, "Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        self.begin_body_task();
        let outcome = self.read_dot_terminated_body().await;
        self.finish_data(outcome).await
    }

    /// Reads the classic DATA body line-by-line until the bare `.`
    /// terminator, undoing dot-stuffing and feeding each unstuffed line to
    /// the spawned processor task. `transition()` has no arm from `Reading`
    /// back to `PostDot`, so that move is made directly once this returns.
    async fn read_dot_terminated_body(&mut self) -> Result<(), SessionError> {
        let limit = self.effective_size_limit();
        loop {
            let frame = self
                .framer_mut()
                .next_frame()
                .await
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
            let line = match frame {
                Frame::Eof => return Err(SessionError::Protocol("connection closed mid-message".to_string())),
                Frame::Bytes(_) => {
                    return Err(SessionError::Protocol("unexpected byte frame during DATA".to_string()))
                }
                Frame::Line(line) => line,
            };
            if line == b"." {
                break;
            }
            let unstuffed: &[u8] = if line.first() == Some(&b'.') { &line[1..] } else { &line };

            let total = self.ctx.envelope.add_received_bytes(unstuffed.len() + 2);
            if let Some(limit) = limit {
                if total > limit {
                    self.abort_body_task();
                    let _ = self
                        .send_error(
                            CommandError::quota(Status::ExceededStorage, "message exceeds maximum size")
                                .closing(),
                        )
                        .await;
                    return Err(SessionError::Protocol("message exceeds maximum size".to_string()));
                }
            }

            let mut chunk = unstuffed.to_vec();
            chunk.extend_from_slice(b"\r\n");
            if self.feed_body_chunk(chunk).await.is_err() {
                break;
            }
        }
        self.state = State::PostDot(crate::state::PostDot);
        Ok(())
    }

    async fn handle_bdat(&mut self, size: usize, last: bool) -> Result<bool, SessionError> {
        if self.body_tx.is_none() && !self.connection_rate_limiter.admit_message(self.peer.ip()).await {
            return Ok(self
                .send_error(CommandError::transient_local(
                    "message rate limit exceeded, try again later",
                ))
                .await?);
        }

        let (ctx, candidate) = match self.try_transition(Command::Bdat { size, last }) {
            Ok(pair) => pair,
            Err(err) => return Ok(self.send_error(err).await?),
        };
        self.ctx = ctx;
        self.state = candidate;

        if self.body_tx.is_none() {
            self.begin_body_task();
        }

        let limit = self.effective_size_limit();
        if size > 0 {
            self.framer_mut().enter_byte_mode(size);
            let frame = self
                .framer_mut()
                .next_frame()
                .await
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
            self.framer_mut().enter_line_mode();
            let chunk = match frame {
                Frame::Bytes(chunk) => chunk,
                Frame::Eof => return Err(SessionError::Protocol("connection closed mid-chunk".to_string())),
                Frame::Line(_) => {
                    return Err(SessionError::Protocol("unexpected line frame during BDAT".to_string()))
                }
            };

            let total = self.ctx.envelope.add_received_bytes(chunk.len());
            if let Some(limit) = limit {
                if total > limit {
                    self.abort_body_task();
                    return Ok(self
                        .send_error(
                            CommandError::quota(Status::ExceededStorage, "message exceeds maximum size")
                                .closing(),
                        )
                        .await?);
                }
            }
            let _ = self.feed_body_chunk(chunk).await;
        }

        if !last {
            self.send_line(Status::Ok, "Continue").await?;
            return Ok(false);
        }

        self.finish_data(Ok(())).await
    }

    fn effective_size_limit(&self) -> Option<usize> {
        let declared = self.ctx.envelope.declared_size();
        match (declared, self.max_message_size) {
            (Some(d), 0) => Some(d),
            (Some(d), m) => Some(d.min(m)),
            (None, 0) => None,
            (None, m) => Some(m),
        }
    }

    fn begin_body_task(&mut self) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let processor = self.processor.clone();
        let mut ctx_for_task = self.ctx.clone();
        let declared_size = self.ctx.envelope.declared_size();
        let handle = tokio::spawn(async move { processor.data(&mut ctx_for_task, rx, declared_size).await });
        self.body_tx = Some(tx);
        self.body_task = Some(handle);
    }

    async fn feed_body_chunk(&mut self, chunk: Vec<u8>) -> Result<(), ()> {
        if let Some(tx) = &self.body_tx {
            tx.send(chunk).await.map_err(|_| ())
        } else {
            Err(())
        }
    }

    fn abort_body_task(&mut self) {
        self.body_tx.take();
        if let Some(task) = self.body_task.take() {
            task.abort();
        }
    }

    async fn finish_data(&mut self, read_outcome: Result<(), SessionError>) -> Result<bool, SessionError> {
        self.body_tx.take();
        let processor_result = match self.body_task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(_) => Err(CommandError::new(
                    Status::TemporarilyUnavailable,
                    "message processing task failed",
                )),
            },
            None => Ok(()),
        };

        if let Err(err) = read_outcome {
            self.event_hook.message_rejected(&err.to_string()).await;
            return Err(err);
        }

        self.processor.done(&mut self.ctx).await;

        match processor_result {
            Ok(()) => {
                let sender = self.ctx.sender();
                let recipients = self.ctx.recipients();
                let tracking_id = self
                    .ctx
                    .tracking_id
                    .clone()
                    .unwrap_or_else(|| self.ctx.id().to_string());
                self.event_hook
                    .message_accepted(&tracking_id, &sender, &recipients)
                    .await;
                self.ctx.envelope = embermail_common::envelope::Envelope::default();
                self.send_line(Status::Ok, "Ok: message accepted").await?;
                Ok(false)
            }
            Err(err) => {
                self.event_hook.message_rejected(&err.message).await;
                Ok(self.send_error(err).await?)
            }
        }
    }

    async fn handle_rset(&mut self) -> Result<bool, SessionError> {
        self.abort_body_task();
        match self.try_transition(Command::Rset) {
            Ok((ctx, candidate)) => {
                self.ctx = ctx;
                self.state = candidate;
                self.send_line(Status::Ok, "Ok").await?;
                Ok(false)
            }
            Err(err) => Ok(self.send_error(err).await?),
        }
    }

    /// QUIT is legal from every state, including `Invalid`, so this applies
    /// the transition directly rather than going through `try_transition`.
    async fn handle_quit(&mut self) -> Result<bool, SessionError> {
        self.abort_body_task();
        self.state = self.state.clone().transition(Command::Quit, &mut self.ctx);
        self.send_line(Status::GoodBye, "Bye").await?;
        Ok(true)
    }

    async fn handle_vrfy(&mut self, term: String) -> Result<bool, SessionError> {
        if !self.vrfy_enabled {
            self.send_line(
                Status::CannotVerify,
                "Cannot verify user, but will accept message and attempt delivery",
            )
            .await?;
            return Ok(false);
        }
        if self.ctx.authenticated_as.is_none() {
            return Ok(self
                .send_error(CommandError::new(Status::AuthRequired, "VRFY requires authentication"))
                .await?);
        }
        match self.user_handler.verify(&term).await.first() {
            Some(address) => self.send_line(Status::Ok, address.clone()).await?,
            None => self.send_line(Status::Error, "No such user").await?,
        }
        Ok(false)
    }

    async fn handle_expn(&mut self, name: String) -> Result<bool, SessionError> {
        if !self.expn_enabled {
            self.send_line(Status::NotImplemented, "Command not implemented").await?;
            return Ok(false);
        }
        if self.ctx.authenticated_as.is_none() {
            return Ok(self
                .send_error(CommandError::new(Status::AuthRequired, "EXPN requires authentication"))
                .await?);
        }
        match self.list_handler.expand(&name).await {
            Some(members) if !members.is_empty() => self.send_multiline(Status::Ok, &members).await?,
            _ => self.send_line(Status::Error, "No such list").await?,
        }
        Ok(false)
    }

    async fn handle_etrn(&mut self, domain: String) -> Result<bool, SessionError> {
        if self.ctx.authenticated_as.is_none() {
            return Ok(self
                .send_error(CommandError::new(Status::AuthRequired, "ETRN requires authentication"))
                .await?);
        }
        self.event_hook.etrn_requested(&domain).await;
        self.send_line(Status::Ok, format!("Queuing for node {domain} started"))
            .await?;
        Ok(false)
    }
}
