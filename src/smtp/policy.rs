use rand::Rng;

use crate::config::{Delay, Mode, MAX_DELAY};

use super::status::Status;

/// The codes a bounced message may be refused with, drawn uniformly.
pub const BOUNCE_CODES: [Status; 10] = [
    Status::MailboxUnavailable,
    Status::ProcessingError,
    Status::InsufficientStorage,
    Status::UnableToQueue,
    Status::DoesNotAcceptMail,
    Status::ActionNotTaken,
    Status::UserNotLocal,
    Status::ExceededStorage,
    Status::NameNotAllowed,
    Status::Blocked,
];

/// The final reply for a completed message.
///
/// `accept` produces `250 OK: queued as <id>`, `bounce` one of
/// [`BOUNCE_CODES`] with its canonical phrase, `random` a coin flip between
/// the two. `offline` resolves to the service-closing notice; it only gets
/// here via a per-message override (an offline listener drops the connection
/// at accept time), and the session hangs up after sending it.
pub fn reply<R: Rng>(mode: Mode, rng: &mut R) -> (Status, String) {
    match mode.base() {
        Mode::Bounce => {
            let status = BOUNCE_CODES[rng.gen_range(0..BOUNCE_CODES.len())];
            (status, status.phrase().to_string())
        }
        Mode::Random => {
            let mode = if rng.gen_bool(0.5) {
                Mode::Accept
            } else {
                Mode::Bounce
            };
            reply(mode, rng)
        }
        Mode::Offline => (Status::Unavailable, Status::Unavailable.phrase().to_string()),
        _ => (Status::Ok, format!("OK: queued as {}", message_id(rng))),
    }
}

/// A short random token identifying the "queued" message, 64 bits of hex.
pub fn message_id<R: Rng>(rng: &mut R) -> String {
    format!("{:016x}", rng.gen::<u64>())
}

/// Per-message overrides carried in the message's own header block.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Overrides {
    pub mode: Option<Mode>,
    pub delay: Option<Delay>,
}

/// Scan the RFC 5322 header block (everything before the first blank line)
/// for `X-Blackhole-Mode` and `X-Blackhole-Delay`.
///
/// Every recognised mode name applies, `offline` included. Unknown or
/// malformed values are ignored, as is any delay that falls outside the
/// limits the configuration itself would be held to.
#[must_use]
pub fn scan(data: &[u8], timeout: u64) -> Overrides {
    let mut overrides = Overrides::default();

    for line in data.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.is_empty() {
            break;
        }

        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());

        if name.eq_ignore_ascii_case("X-Blackhole-Mode") {
            if let Ok(mode) = value.parse::<Mode>() {
                overrides.mode = Some(mode);
            }
        } else if name.eq_ignore_ascii_case("X-Blackhole-Delay") {
            if let Ok(delay) = value.parse::<Delay>() {
                if delay.upper() <= MAX_DELAY && (timeout == 0 || delay.upper() < timeout) {
                    overrides.delay = Some(delay);
                }
            }
        }
    }

    overrides
}
