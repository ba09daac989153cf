use std::{
    fmt::{self, Display, Formatter},
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use rand::Rng;
use thiserror::Error;

/// Hard ceiling on the idle timer, seconds.
pub const MAX_TIMEOUT: u64 = 180;
/// Hard ceiling on the response delay, seconds.
pub const MAX_DELAY: u64 = 60;

const DEFAULT_TIMEOUT: u64 = 60;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 512_000;
const DEFAULT_MAX_SESSIONS: usize = 2000;
const DEFAULT_LISTEN: &str = "127.0.0.1:25";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected `key = value`, found {found:?}")]
    Syntax { line: usize, found: String },

    #[error("line {line}: unknown directive {key:?}")]
    UnknownKey { line: usize, key: String },

    #[error("line {line}: invalid value for {key}: {reason}")]
    InvalidValue {
        line: usize,
        key: String,
        reason: String,
    },

    #[error("timeout {0}s exceeds the maximum of {MAX_TIMEOUT}s")]
    TimeoutTooLarge(u64),

    #[error("delay {0}s exceeds the maximum of {MAX_DELAY}s")]
    DelayTooLarge(u64),

    #[error("delay {delay}s must be less than timeout {timeout}s")]
    DelayExceedsTimeout { delay: u64, timeout: u64 },

    #[error("{context} requires both tls_cert and tls_key")]
    MissingTlsMaterial { context: &'static str },

    #[error("Unable to find TLS material {0}")]
    TlsMaterialNotFound(PathBuf),

    #[error("Unable to resolve {host:?}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("at least one worker is required")]
    NoWorkers,
}

/// How the server answers once a message has been fully received.
///
/// The `*Delay` variants resolve to the same reply as their base variant;
/// the wait itself is governed by the effective delay setting, so they are
/// only meaningful where a mode name stands alone (configuration files and
/// the `X-Blackhole-Mode` header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Accept,
    Bounce,
    Random,
    AcceptDelay,
    BounceDelay,
    RandomDelay,
    Offline,
}

impl Mode {
    /// Collapse the `*Delay` variants onto their base reply behaviour.
    #[must_use]
    pub const fn base(self) -> Self {
        match self {
            Self::AcceptDelay => Self::Accept,
            Self::BounceDelay => Self::Bounce,
            Self::RandomDelay => Self::Random,
            other => other,
        }
    }

    #[must_use]
    pub const fn is_offline(self) -> bool {
        matches!(self, Self::Offline)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode.to_ascii_lowercase().trim() {
            "accept" => Ok(Self::Accept),
            "bounce" => Ok(Self::Bounce),
            "random" => Ok(Self::Random),
            "accept_delay" => Ok(Self::AcceptDelay),
            "bounce_delay" => Ok(Self::BounceDelay),
            "random_delay" => Ok(Self::RandomDelay),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unrecognised mode {other:?}")),
        }
    }
}

impl Display for Mode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Accept => "accept",
            Self::Bounce => "bounce",
            Self::Random => "random",
            Self::AcceptDelay => "accept_delay",
            Self::BounceDelay => "bounce_delay",
            Self::RandomDelay => "random_delay",
            Self::Offline => "offline",
        })
    }
}

/// Seconds to wait between end-of-data and the final reply, either fixed or
/// drawn uniformly from an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Fixed(u64),
    Range(u64, u64),
}

impl Delay {
    /// The value used for this message, drawn from the session's RNG.
    pub fn draw<R: Rng>(self, rng: &mut R) -> u64 {
        match self {
            Self::Fixed(secs) => secs,
            Self::Range(lo, hi) => rng.gen_range(lo..=hi),
        }
    }

    /// Upper bound, used for invariant checks against the timeout.
    #[must_use]
    pub const fn upper(self) -> u64 {
        match self {
            Self::Fixed(secs) | Self::Range(_, secs) => secs,
        }
    }
}

impl FromStr for Delay {
    type Err = String;

    fn from_str(delay: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| format!("expected a nonnegative integer, found {part:?}"))
        };

        match delay.split_once('-') {
            None => parse(delay).map(Self::Fixed),
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(format!("range {lo}-{hi} is inverted"));
                }
                Ok(Self::Range(lo, hi))
            }
        }
    }
}

/// One socket to bind, with any per-listener overrides.
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub mode: Option<Mode>,
    pub delay: Option<Delay>,
}

impl ListenerSpec {
    /// Resolve the configured host to the socket addresses to bind.
    ///
    /// An empty host binds every IPv4 interface; `::` binds every IPv6
    /// interface; anything else is an address literal or a hostname resolved
    /// at startup.
    ///
    /// # Errors
    ///
    /// An unresolvable host is a configuration error.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };

        (host, self.port)
            .to_socket_addrs()
            .map(Iterator::collect)
            .map_err(|source| ConfigError::Resolve {
                host: self.host.clone(),
                source,
            })
    }

    fn parse_entry(entry: &str, tls: bool, line: usize) -> Result<Self, ConfigError> {
        let key = if tls { "tls_listen" } else { "listen" };
        let invalid = |reason: String| ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            reason,
        };

        let mut parts = entry.split_whitespace();
        let address = parts
            .next()
            .ok_or_else(|| invalid("empty listener entry".to_string()))?;

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid(format!("expected HOST:PORT, found {address:?}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = port
            .parse::<u16>()
            .map_err(|_| invalid(format!("invalid port in {address:?}")))?;

        let mut spec = Self {
            host: host.to_string(),
            port,
            tls,
            mode: None,
            delay: None,
        };

        for flag in parts {
            if let Some(mode) = flag.strip_prefix("mode=") {
                spec.mode = Some(mode.parse().map_err(invalid)?);
            } else if let Some(delay) = flag.strip_prefix("delay=") {
                spec.delay = Some(delay.parse().map_err(invalid)?);
            } else {
                return Err(invalid(format!("unrecognised flag {flag:?}")));
            }
        }

        Ok(spec)
    }

    /// Parse a comma-separated `listen`/`tls_listen` directive.
    ///
    /// A range delay is written `delay=5,10`, so a segment consisting of a
    /// bare integer belongs to the previous entry's delay rather than being
    /// an entry of its own.
    fn parse_list(value: &str, tls: bool, line: usize) -> Result<Vec<Self>, ConfigError> {
        let key = if tls { "tls_listen" } else { "listen" };
        let mut specs: Vec<Self> = Vec::new();

        for segment in value.split(',') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }

            if segment.bytes().all(|b| b.is_ascii_digit()) {
                let hi = segment.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    line,
                    key: key.to_string(),
                    reason: format!("invalid delay bound {segment:?}"),
                })?;

                match specs.last_mut() {
                    Some(spec) => match spec.delay {
                        Some(Delay::Fixed(lo)) if lo <= hi => {
                            spec.delay = Some(Delay::Range(lo, hi));
                        }
                        Some(Delay::Fixed(lo)) => {
                            return Err(ConfigError::InvalidValue {
                                line,
                                key: key.to_string(),
                                reason: format!("delay range {lo},{hi} is inverted"),
                            });
                        }
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                line,
                                key: key.to_string(),
                                reason: format!("stray delay bound {segment:?}"),
                            });
                        }
                    },
                    None => {
                        return Err(ConfigError::InvalidValue {
                            line,
                            key: key.to_string(),
                            reason: format!("stray delay bound {segment:?}"),
                        });
                    }
                }

                continue;
            }

            specs.push(Self::parse_entry(segment, tls, line)?);
        }

        Ok(specs)
    }
}

/// The aggregate runtime configuration, shared by the supervisor and every
/// worker it forks.
#[derive(Debug, Clone)]
pub struct Config {
    pub listeners: Vec<ListenerSpec>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_dhparams: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub pidfile: Option<PathBuf>,
    pub timeout: u64,
    pub delay: Option<Delay>,
    pub mode: Mode,
    pub max_message_size: usize,
    pub dynamic_switch: bool,
    pub workers: usize,
    pub starttls: bool,
    pub max_sessions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            tls_cert: None,
            tls_key: None,
            tls_dhparams: None,
            user: None,
            group: None,
            pidfile: None,
            timeout: DEFAULT_TIMEOUT,
            delay: None,
            mode: Mode::Accept,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            dynamic_switch: true,
            workers: 1,
            starttls: false,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl Config {
    /// Read and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Any unreadable file, syntax error, unknown directive, or violated
    /// invariant is fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        Self::parse(&source)
    }

    /// Parse and validate configuration text.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let mut config = Self {
            listeners: Vec::new(),
            ..Self::default()
        };

        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let text = raw.trim();

            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            let (key, value) = text
                .split_once('=')
                .ok_or_else(|| ConfigError::Syntax {
                    line,
                    found: text.to_string(),
                })?;
            let (key, value) = (key.trim(), value.trim());

            let invalid = |reason: String| ConfigError::InvalidValue {
                line,
                key: key.to_string(),
                reason,
            };

            match key {
                "listen" => config
                    .listeners
                    .extend(ListenerSpec::parse_list(value, false, line)?),
                "tls_listen" => config
                    .listeners
                    .extend(ListenerSpec::parse_list(value, true, line)?),
                "tls_cert" => config.tls_cert = Some(PathBuf::from(value)),
                "tls_key" => config.tls_key = Some(PathBuf::from(value)),
                "tls_dhparams" => config.tls_dhparams = Some(PathBuf::from(value)),
                "user" => config.user = Some(value.to_string()),
                "group" => config.group = Some(value.to_string()),
                "pidfile" => config.pidfile = Some(PathBuf::from(value)),
                "timeout" => config.timeout = parse_int(value).map_err(invalid)?,
                "delay" => {
                    let delay = parse_int(value).map_err(invalid)?;
                    config.delay = (delay > 0).then_some(Delay::Fixed(delay));
                }
                "mode" => config.mode = value.parse().map_err(invalid)?,
                "max_message_size" => {
                    config.max_message_size =
                        parse_int(value).map_err(invalid)?.try_into().unwrap_or(usize::MAX);
                }
                "dynamic_switch" => config.dynamic_switch = parse_bool(value).map_err(invalid)?,
                "workers" => {
                    config.workers = parse_int(value)
                        .map_err(invalid)?
                        .try_into()
                        .unwrap_or(usize::MAX);
                }
                "starttls" => config.starttls = parse_bool(value).map_err(invalid)?,
                "max_sessions" => {
                    config.max_sessions = parse_int(value)
                        .map_err(invalid)?
                        .try_into()
                        .unwrap_or(usize::MAX);
                }
                _ => {
                    return Err(ConfigError::UnknownKey {
                        line,
                        key: key.to_string(),
                    })
                }
            }
        }

        if config.listeners.is_empty() {
            config
                .listeners
                .push(ListenerSpec::parse_entry(DEFAULT_LISTEN, false, 0)?);
        }

        config.validate()?;

        Ok(config)
    }

    /// Check every invariant that is fatal at startup.
    ///
    /// # Errors
    ///
    /// The first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        if self.timeout > MAX_TIMEOUT {
            return Err(ConfigError::TimeoutTooLarge(self.timeout));
        }

        let delays = self
            .delay
            .iter()
            .chain(self.listeners.iter().filter_map(|spec| spec.delay.as_ref()));

        for delay in delays {
            if delay.upper() > MAX_DELAY {
                return Err(ConfigError::DelayTooLarge(delay.upper()));
            }

            if self.timeout > 0 && delay.upper() >= self.timeout {
                return Err(ConfigError::DelayExceedsTimeout {
                    delay: delay.upper(),
                    timeout: self.timeout,
                });
            }
        }

        let has_material = self.tls_cert.is_some() && self.tls_key.is_some();

        if self.listeners.iter().any(|spec| spec.tls) && !has_material {
            return Err(ConfigError::MissingTlsMaterial {
                context: "tls_listen",
            });
        }

        if self.starttls && !has_material {
            return Err(ConfigError::MissingTlsMaterial {
                context: "starttls",
            });
        }

        for path in [&self.tls_cert, &self.tls_key, &self.tls_dhparams]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                return Err(ConfigError::TlsMaterialNotFound(path.clone()));
            }
        }

        for spec in &self.listeners {
            spec.resolve()?;
        }

        Ok(())
    }

    /// The effective response mode for a listener, per-listener overrides
    /// shadowing the global without mutating it.
    #[must_use]
    pub fn mode_for(&self, spec: &ListenerSpec) -> Mode {
        spec.mode.unwrap_or(self.mode)
    }

    /// The effective delay for a listener.
    #[must_use]
    pub fn delay_for(&self, spec: &ListenerSpec) -> Option<Delay> {
        spec.delay.or(self.delay)
    }

    /// The idle timer, `None` when disabled.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

fn parse_int(value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| format!("expected a nonnegative integer, found {value:?}"))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true or false, found {other:?}")),
    }
}
