use core::fmt::{self, Display, Formatter};

use super::{
    command::{Command, HeloVariant},
    envelope::Envelope,
    status::Status,
};

/// Where a session is in the protocol exchange.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Default)]
pub enum State {
    #[default]
    Connect,
    Helo,
    MailFrom,
    RcptTo,
    Reading,
    StartTls,
    Quit,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Connect => "Connect",
            Self::Helo => "HELO",
            Self::MailFrom => "MAIL",
            Self::RcptTo => "RCPT",
            Self::Reading => "DATA",
            Self::StartTls => "STARTTLS",
            Self::Quit => "QUIT",
        })
    }
}

/// Everything a transition may consult or update besides the state itself.
#[derive(Default, Debug)]
pub struct Context {
    pub extended: bool,
    pub id: String,
    pub envelope: Envelope,
    /// Set when the reply deviates from the happy path for the new state.
    pub response: Option<(Status, String)>,
    /// Whether STARTTLS may currently be negotiated.
    pub tls_available: bool,
}

impl Context {
    fn respond(&mut self, status: Status) {
        self.response = Some((status, status.phrase().to_string()));
    }
}

impl State {
    /// Drive the state machine with one parsed command.
    ///
    /// Happy-path replies are rendered from the returned state; anything else
    /// (refusals, fixed-text commands) lands in `ctx.response` and leaves the
    /// state alone.
    #[must_use]
    pub(crate) fn transition(self, command: Command, ctx: &mut Context) -> Self {
        match (self, command) {
            (state, Command::Invalid(_)) => {
                ctx.respond(Status::SyntaxError);
                state
            }
            (state, Command::Malformed(_)) => {
                ctx.respond(Status::ArgumentSyntaxError);
                state
            }

            (_, Command::Quit) => Self::Quit,

            (state, Command::Noop) => {
                ctx.respond(Status::Ok);
                state
            }
            (state, Command::Vrfy) => {
                ctx.respond(Status::CannotVerify);
                state
            }
            (state, Command::Expn) => {
                ctx.respond(Status::NotImplemented);
                state
            }
            (state, Command::Help) => {
                ctx.respond(Status::HelpMessage);
                state
            }

            (_, Command::Helo(HeloVariant::Ehlo(id))) => {
                ctx.id = id;
                ctx.extended = true;
                ctx.envelope.clear();
                Self::Helo
            }
            (_, Command::Helo(HeloVariant::Helo(id))) => {
                ctx.id = id;
                ctx.extended = false;
                ctx.envelope.clear();
                Self::Helo
            }

            (Self::Connect, Command::Rset) => {
                ctx.respond(Status::Ok);
                Self::Connect
            }
            (_, Command::Rset) => {
                ctx.envelope.clear();
                ctx.respond(Status::Ok);
                Self::Helo
            }

            (Self::Helo, Command::StartTls) if ctx.tls_available => Self::StartTls,
            (Self::Helo, Command::StartTls) => {
                ctx.respond(Status::NotImplemented);
                Self::Helo
            }

            (Self::Helo, Command::MailFrom(sender)) => {
                *ctx.envelope.sender_mut() = sender;
                Self::MailFrom
            }

            (Self::MailFrom | Self::RcptTo, Command::RcptTo(recipients)) => {
                if let Some(rcpts) = ctx.envelope.recipients_mut() {
                    rcpts.extend_from_slice(&recipients[..]);
                } else {
                    *ctx.envelope.recipients_mut() = Some(recipients);
                }
                Self::RcptTo
            }

            (Self::RcptTo, Command::Data) => Self::Reading,

            // A recognised command at the wrong point in the exchange
            (state, _) => {
                ctx.respond(Status::InvalidCommandSequence);
                state
            }
        }
    }
}
