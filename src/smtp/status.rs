use core::fmt::{self, Display, Formatter};

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    HelpMessage = 214,
    ServiceReady = 220,
    GoodBye = 221,
    Ok = 250,
    CannotVerify = 252,
    StartMailInput = 354,
    Unavailable = 421,
    MailboxUnavailable = 450,
    ProcessingError = 451,
    InsufficientStorage = 452,
    UnableToQueue = 458,
    SyntaxError = 500,
    ArgumentSyntaxError = 501,
    NotImplemented = 502,
    InvalidCommandSequence = 503,
    DoesNotAcceptMail = 521,
    ActionNotTaken = 550,
    UserNotLocal = 551,
    ExceededStorage = 552,
    NameNotAllowed = 553,
    Blocked = 571,
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        self as u16 >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&(self as u16))
    }

    /// The canonical reply text for this status.
    #[must_use]
    pub const fn phrase(self) -> &'static str {
        match self {
            Self::HelpMessage => "See https://tools.ietf.org/html/rfc5321",
            Self::ServiceReady => "Service ready",
            Self::GoodBye => "Bye",
            Self::Ok => "OK",
            Self::CannotVerify => "Cannot VRFY user, but will accept message and attempt delivery",
            Self::StartMailInput => "End data with <CR><LF>.<CR><LF>",
            Self::Unavailable => "Service not available, closing transmission channel",
            Self::MailboxUnavailable => "Requested mail action not taken: mailbox unavailable",
            Self::ProcessingError => "Requested action aborted: local error in processing",
            Self::InsufficientStorage => "Requested action not taken: insufficient system storage",
            Self::UnableToQueue => "Unable to queue messages",
            Self::SyntaxError => "Syntax error, command unrecognised",
            Self::ArgumentSyntaxError => "Syntax error in parameters or arguments",
            Self::NotImplemented => "Command not implemented",
            Self::InvalidCommandSequence => "Bad sequence of commands",
            Self::DoesNotAcceptMail => "Machine does not accept mail",
            Self::ActionNotTaken => "Requested action not taken: mailbox unavailable",
            Self::UserNotLocal => "User not local",
            Self::ExceededStorage => "Requested mail action aborted: exceeded storage allocation",
            Self::NameNotAllowed => "Requested action not taken: mailbox name not allowed",
            Self::Blocked => "Blocked",
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", *self as u16)
    }
}
