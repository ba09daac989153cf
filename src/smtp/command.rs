use core::fmt::{self, Display, Formatter};

use mailparse::MailAddrList;

#[derive(PartialEq, Eq, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Debug)]
pub enum Command {
    Helo(HeloVariant),
    /// If this is `None`, then it should be assumed this is the `null sender`,
    /// or `null reverse-path`, from [RFC-5321](https://www.ietf.org/rfc/rfc5321.txt).
    MailFrom(Option<MailAddrList>),
    RcptTo(MailAddrList),
    Data,
    Rset,
    Noop,
    Vrfy,
    Expn,
    Help,
    Quit,
    StartTls,
    /// A recognised command whose arguments do not parse.
    Malformed(String),
    /// A command we do not recognise at all.
    Invalid(String),
}

impl Command {
    #[must_use]
    pub fn inner(&self) -> String {
        match self {
            Self::MailFrom(from) => from.clone().map(|f| f.to_string()).unwrap_or_default(),
            Self::RcptTo(to) => to.to_string(),
            Self::Malformed(command) | Self::Invalid(command) => command.clone(),
            Self::Helo(HeloVariant::Ehlo(id) | HeloVariant::Helo(id)) => id.clone(),
            _ => String::default(),
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => fmt.write_fmt(format_args!("{} {}", v, self.inner())),
            Self::MailFrom(s) => fmt.write_fmt(format_args!(
                "MAIL FROM:{}",
                s.clone().map(|f| f.to_string()).unwrap_or_default()
            )),
            Self::RcptTo(rcpt) => fmt.write_fmt(format_args!("RCPT TO:{rcpt}")),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Vrfy => fmt.write_str("VRFY"),
            Self::Expn => fmt.write_str("EXPN"),
            Self::Help => fmt.write_str("HELP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Malformed(s) | Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let comm = command.to_ascii_uppercase();
        let comm = comm.trim();

        if comm.starts_with("MAIL FROM:") {
            if comm.len() < 11 {
                return Err(Self::Malformed(command.to_owned()));
            }

            // Anything after the forward-path is an ESMTP parameter
            // (SIZE=..., BODY=...); a sink has no use for them
            let addr = strip_parameters(command.trim()[10..].trim());

            // Handle the null sender explicitly, as mailparse doesn't tend
            // to like it
            if addr == "<>" {
                return Ok(Self::MailFrom(None));
            }

            let from = mailparse::addrparse(addr)
                .map_err(|_| Self::Malformed(command.to_owned()))?;

            Ok(Self::MailFrom(if from.is_empty() {
                None
            } else {
                Some(from)
            }))
        } else if comm.starts_with("RCPT TO:") {
            if comm.len() < 9 {
                return Err(Self::Malformed(command.to_owned()));
            }

            let addr = strip_parameters(command.trim()[8..].trim());

            let to = mailparse::addrparse(addr)
                .map_err(|_| Self::Malformed(command.to_owned()))?;

            if to.is_empty() {
                return Err(Self::Malformed(command.to_owned()));
            }

            Ok(Self::RcptTo(to))
        } else if comm.starts_with("EHLO") || comm.starts_with("HELO") {
            let Some((command, host)) = command.trim().split_once(' ') else {
                return Err(Self::Malformed(format!("Expected hostname in {comm}")));
            };

            Ok(if command.to_ascii_uppercase().starts_with('H') {
                Self::Helo(HeloVariant::Helo(host.trim().to_string()))
            } else {
                Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))
            })
        } else {
            // Dispatch on the verb alone; arguments to these are irrelevant
            // to a sink
            match comm.split_whitespace().next().unwrap_or_default() {
                "DATA" => Ok(Self::Data),
                "RSET" => Ok(Self::Rset),
                "NOOP" => Ok(Self::Noop),
                "VRFY" => Ok(Self::Vrfy),
                "EXPN" => Ok(Self::Expn),
                "HELP" => Ok(Self::Help),
                "QUIT" => Ok(Self::Quit),
                "STARTTLS" => Ok(Self::StartTls),
                _ => Err(Self::Invalid(command.to_owned())),
            }
        }
    }
}

/// Cut a `MAIL FROM`/`RCPT TO` argument down to its address, dropping any
/// trailing ESMTP parameters.
fn strip_parameters(argument: &str) -> &str {
    if let Some(end) = argument.find('>') {
        &argument[..=end]
    } else {
        argument
            .split_whitespace()
            .next()
            .unwrap_or(argument)
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or(
            Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}
