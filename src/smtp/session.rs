use std::{net::SocketAddr, sync::Arc, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::{Delay, Mode},
    incoming, internal, outgoing, Signal,
};

use super::{
    command::Command,
    connection::{Connection, Line},
    policy,
    state::{Context, State},
    status::Status,
};

/// RFC 5321 limit on a command line, terminator included.
pub const MAX_COMMAND_LINE: usize = 512;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

/// Everything a listener decides on behalf of the sessions it accepts.
#[derive(Clone)]
pub struct SessionConfig {
    pub banner: Arc<str>,
    pub mode: Mode,
    pub delay: Option<Delay>,
    pub timeout: Option<Duration>,
    pub max_message_size: usize,
    pub dynamic_switch: bool,
    /// Set when STARTTLS may be negotiated on this (cleartext) listener.
    pub starttls: Option<TlsAcceptor>,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    connection: Connection<Stream>,
    config: SessionConfig,
    context: Context,
    state: State,
    rng: StdRng,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(stream: Stream, peer: SocketAddr, config: SessionConfig) -> Self {
        Self::with_connection(Connection::plain(stream), peer, config)
    }

    pub fn with_connection(
        connection: Connection<Stream>,
        peer: SocketAddr,
        config: SessionConfig,
    ) -> Self {
        let context = Context {
            tls_available: config.starttls.is_some(),
            ..Context::default()
        };

        Self {
            peer,
            connection,
            config,
            context,
            state: State::Connect,
            rng: StdRng::from_entropy(),
        }
    }

    /// Drive the client through the protocol until it quits, vanishes, times
    /// out, or the worker shuts down.
    #[allow(clippy::too_many_lines)]
    pub async fn run(
        mut self,
        mut signal: broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected to {}", self.peer);

        if self.config.mode.is_offline() {
            // The client learns nothing, not even a banner
            internal!(level = DEBUG, "Dropping {} without a banner", self.peer);
            return Ok(());
        }

        self.send(format!(
            "{} {} ESMTP Blackhole",
            Status::ServiceReady,
            self.config.banner
        ))
        .await?;

        let mut signal_live = true;

        loop {
            let line = tokio::select! {
                sig = signal.recv(), if signal_live => {
                    match sig {
                        Ok(Signal::Shutdown) => {
                            let _ = self
                                .send(format!(
                                    "{} {} Service closing transmission channel",
                                    Status::Unavailable,
                                    self.config.banner
                                ))
                                .await;
                            internal!(level = DEBUG, "Session with {} cut short by shutdown", self.peer);
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            signal_live = false;
                            continue;
                        }
                        _ => continue,
                    }
                }

                line = self.next_line(MAX_COMMAND_LINE) => line?,
            };

            let command = match line {
                None => {
                    internal!(level = DEBUG, "{} went away", self.peer);
                    return Ok(());
                }
                Some(Line::TooLong) => {
                    self.send(format!("{} Line too long", Status::SyntaxError))
                        .await?;
                    continue;
                }
                Some(Line::Complete(bytes)) => {
                    Command::try_from(&bytes[..]).unwrap_or_else(|invalid| invalid)
                }
            };

            incoming!("{command}");

            self.state = self.state.transition(command, &mut self.context);

            if let Some((status, text)) = self.context.response.take() {
                self.send(format!("{status} {text}")).await?;
                continue;
            }

            match self.state {
                State::Helo => {
                    for line in self.greeting() {
                        self.send(line).await?;
                    }
                }

                State::MailFrom | State::RcptTo => {
                    self.send(format!("{} {}", Status::Ok, Status::Ok.phrase()))
                        .await?;
                }

                State::Reading => {
                    self.send(format!(
                        "{} {}",
                        Status::StartMailInput,
                        Status::StartMailInput.phrase()
                    ))
                    .await?;

                    let Some((body, oversized)) = self.receive_body().await? else {
                        internal!(level = DEBUG, "{} went away mid-message", self.peer);
                        return Ok(());
                    };

                    // Ready for the next transaction on the same connection
                    self.state = State::Helo;
                    self.context.envelope.clear();

                    if oversized {
                        self.send(format!(
                            "{} {}",
                            Status::ExceededStorage,
                            Status::ExceededStorage.phrase()
                        ))
                        .await?;
                        continue;
                    }

                    let overrides = if self.config.dynamic_switch {
                        policy::scan(&body, self.idle_secs())
                    } else {
                        policy::Overrides::default()
                    };
                    drop(body);

                    let mode = overrides.mode.unwrap_or(self.config.mode);
                    let delay = overrides.delay.or(self.config.delay);

                    if let Some(delay) = delay {
                        let secs = delay.draw(&mut self.rng);
                        if secs > 0 && !self.pause(secs, &mut signal, &mut signal_live).await {
                            let _ = self
                                .send(format!(
                                    "{} {} Service closing transmission channel",
                                    Status::Unavailable,
                                    self.config.banner
                                ))
                                .await;
                            return Ok(());
                        }
                    }

                    let (status, text) = policy::reply(mode, &mut self.rng);
                    self.send(format!("{status} {text}")).await?;

                    // A message may switch the session offline; the client
                    // heard the closing notice, there is nothing more to say
                    if mode.is_offline() {
                        internal!(level = DEBUG, "{} switched offline", self.peer);
                        return Ok(());
                    }
                }

                State::StartTls => {
                    let Some(acceptor) = self.config.starttls.clone() else {
                        self.send(format!(
                            "{} {}",
                            Status::NotImplemented,
                            Status::NotImplemented.phrase()
                        ))
                        .await?;
                        self.state = State::Helo;
                        continue;
                    };

                    self.send(format!("{} Ready to start TLS", Status::ServiceReady))
                        .await?;

                    let connection = self.connection;
                    match connection.upgrade(&acceptor).await {
                        Ok((connection, info)) => {
                            internal!(
                                level = DEBUG,
                                "Connection with {} upgraded ({} {})",
                                self.peer,
                                info.proto(),
                                info.cipher()
                            );

                            self.connection = connection;
                            // The secured channel starts over with a fresh
                            // HELO; STARTTLS is no longer on the table
                            self.context = Context::default();
                            self.state = State::Connect;
                        }
                        Err(err) => {
                            internal!(
                                level = DEBUG,
                                "TLS handshake with {} failed: {err}",
                                self.peer
                            );
                            return Ok(());
                        }
                    }
                }

                State::Quit => {
                    self.send(format!("{} {}", Status::GoodBye, Status::GoodBye.phrase()))
                        .await?;
                    internal!(level = DEBUG, "{} said goodbye", self.peer);
                    return Ok(());
                }

                // Reachable only via the post-upgrade reset, which already
                // replied
                State::Connect => {}
            }
        }
    }

    /// Accumulate the message body until the terminating dot.
    ///
    /// Returns the stored body (dot-stuffing undone, terminator excluded) and
    /// whether it outgrew `max_message_size`; `None` when the peer
    /// disconnected mid-message.
    async fn receive_body(&mut self) -> Result<Option<(Vec<u8>, bool)>, SessionError> {
        // A body line may legitimately be as large as the whole message
        let limit = self.config.max_message_size.max(MAX_COMMAND_LINE);

        let mut body = Vec::new();
        let mut oversized = false;

        loop {
            match self.next_line(limit).await? {
                None => return Ok(None),
                Some(Line::TooLong) => oversized = true,
                Some(Line::Complete(line)) => {
                    if line == b"." {
                        break;
                    }

                    let line: &[u8] = if line.first() == Some(&b'.') {
                        &line[1..]
                    } else {
                        &line
                    };

                    if !oversized
                        && !Self::store_line(&mut body, line, self.config.max_message_size)
                    {
                        // Too big to keep, but keep consuming so the client
                        // reaches its end-of-data and can hear the refusal
                        oversized = true;
                    }
                }
            }
        }

        if oversized {
            body.clear();
        }

        Ok(Some((body, oversized)))
    }

    fn store_line(body: &mut Vec<u8>, line: &[u8], max: usize) -> bool {
        if body.len() + line.len() + 2 > max {
            return false;
        }

        body.extend_from_slice(line);
        body.extend_from_slice(b"\r\n");
        true
    }

    /// One read, bounded by the idle timer when one is configured. A lapsed
    /// timer tells the client before the socket closes.
    async fn next_line(&mut self, limit: usize) -> Result<Option<Line>, SessionError> {
        match self.config.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.connection.read_line(limit)).await {
                    Ok(line) => Ok(line?),
                    Err(_) => {
                        let _ = self
                            .send(format!("{} Timeout", Status::Unavailable))
                            .await;
                        Err(SessionError::Timeout(timeout.as_secs()))
                    }
                }
            }
            None => Ok(self.connection.read_line(limit).await?),
        }
    }

    /// Sleep out the response delay. The idle timer does not run here, but a
    /// worker shutdown still interrupts; returns `false` when it did.
    async fn pause(
        &mut self,
        secs: u64,
        signal: &mut broadcast::Receiver<Signal>,
        signal_live: &mut bool,
    ) -> bool {
        internal!(level = DEBUG, "Delaying reply to {} for {secs}s", self.peer);

        let sleep = tokio::time::sleep(Duration::from_secs(secs));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,

                sig = signal.recv(), if *signal_live => match sig {
                    Ok(Signal::Shutdown) => return false,
                    Err(broadcast::error::RecvError::Closed) => *signal_live = false,
                    _ => {}
                },
            }
        }
    }

    fn greeting(&self) -> Vec<String> {
        if !self.context.extended {
            return vec![format!(
                "{} {} Hello {}",
                Status::Ok,
                self.config.banner,
                self.context.id
            )];
        }

        let mut extensions = vec![
            format!("SIZE {}", self.config.max_message_size),
            "PIPELINING".to_string(),
        ];

        if self.context.tls_available {
            extensions.push("STARTTLS".to_string());
        }

        let mut lines = vec![format!(
            "{}-{} Hello {}",
            Status::Ok,
            self.config.banner,
            self.context.id
        )];

        let last = extensions.len() - 1;
        lines.extend(extensions.iter().enumerate().map(|(idx, extension)| {
            format!(
                "{}{}{}",
                Status::Ok,
                if idx == last { ' ' } else { '-' },
                extension
            )
        }));

        lines
    }

    fn idle_secs(&self) -> u64 {
        self.config.timeout.map_or(0, |timeout| timeout.as_secs())
    }

    async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: S,
    ) -> Result<(), SessionError> {
        outgoing!("{response}");
        self.connection.send(&response).await.map_err(Into::into)
    }
}
