use std::{
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    path::PathBuf,
    process::exit,
    time::Duration,
};

use nix::{
    sys::{
        signal::{kill, SigSet, SigmaskHow, Signal as Sig, sigprocmask},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, setsid, ForkResult, Pid},
};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::{
    config::{Config, ConfigError, ListenerSpec},
    internal,
    worker::{supervised_signals, Worker},
};

/// Pause before replacing a worker that died, so a crash on boot cannot turn
/// into a fork storm.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: i32 = 1024;

// sysexits.h exit codes, not exposed by the `libc` crate on this platform.
pub const EX_USAGE: i32 = 64;
pub const EX_OSERR: i32 = 71;
pub const EX_NOPERM: i32 = 77;
pub const EX_CONFIG: i32 = 78;
pub const EX_UNAVAILABLE: i32 = 69;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Unable to drop privileges: {0}")]
    PrivilegeDrop(String),

    #[error("Unable to write pidfile {path}: {source}")]
    Pidfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unable to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Unable to daemonize: {0}")]
    Daemonize(#[source] nix::Error),

    #[error("Signal handling failed: {0}")]
    Signals(#[source] nix::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// sysexits-style process exit code for startup failures.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => EX_CONFIG,
            Self::Bind { .. } => EX_UNAVAILABLE,
            Self::PrivilegeDrop(_) => EX_NOPERM,
            _ => EX_OSERR,
        }
    }
}

/// The parent process: binds the sockets while it still may, forks the
/// workers, and stays behind only to watch them.
pub struct Supervisor {
    config: Config,
    config_path: Option<PathBuf>,
    sockets: Vec<(std::net::TcpListener, SocketAddr, ListenerSpec)>,
    children: Vec<Pid>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
            sockets: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Bind, drop privileges, fork the workers, and babysit them until told
    /// to stop.
    ///
    /// # Errors
    ///
    /// Startup failures (bind, privilege drop, pidfile, first forks); see
    /// [`SupervisorError::exit_code`] for how they surface.
    pub fn run(mut self) -> Result<(), SupervisorError> {
        self.bind()?;
        self.drop_privileges()?;
        self.write_pidfile()?;

        // Blocked before the first fork so no child exit can slip between
        // spawning and waiting
        let mask = supervised_signals();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .map_err(SupervisorError::Signals)?;

        for _ in 0..self.config.workers {
            let child = self.spawn_worker()?;
            self.children.push(child);
        }

        let result = self.watch(&mask);
        self.remove_pidfile();
        result
    }

    fn bind(&mut self) -> Result<(), SupervisorError> {
        for spec in self.config.listeners.clone() {
            for address in spec.resolve()? {
                let socket = bind_socket(address)
                    .map_err(|source| SupervisorError::Bind { address, source })?;

                internal!(level = INFO, "Bound {address}");
                self.sockets.push((socket, address, spec.clone()));
            }
        }

        Ok(())
    }

    fn drop_privileges(&self) -> Result<(), SupervisorError> {
        if self.config.user.is_none() && self.config.group.is_none() {
            return Ok(());
        }

        let mut drop = privdrop::PrivDrop::default();

        if let Some(user) = &self.config.user {
            drop = drop.user(user);
        }
        if let Some(group) = &self.config.group {
            drop = drop.group(group);
        }

        drop.apply()
            .map_err(|err| SupervisorError::PrivilegeDrop(err.to_string()))?;

        internal!(
            level = INFO,
            "Privileges dropped to {}:{}",
            self.config.user.as_deref().unwrap_or("-"),
            self.config.group.as_deref().unwrap_or("-")
        );

        Ok(())
    }

    fn write_pidfile(&self) -> Result<(), SupervisorError> {
        if let Some(path) = &self.config.pidfile {
            std::fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
                SupervisorError::Pidfile {
                    path: path.clone(),
                    source,
                }
            })?;
        }

        Ok(())
    }

    fn remove_pidfile(&self) {
        if let Some(path) = &self.config.pidfile {
            let _ = std::fs::remove_file(path);
        }
    }

    fn spawn_worker(&self) -> Result<Pid, SupervisorError> {
        // Each worker gets duplicated descriptors; the underlying bound
        // sockets are shared through the fork either way
        let sockets = self
            .sockets
            .iter()
            .map(|(socket, address, spec)| Ok((socket.try_clone()?, *address, spec.clone())))
            .collect::<Result<Vec<_>, io::Error>>()?;

        match unsafe { fork() }.map_err(SupervisorError::Fork)? {
            ForkResult::Parent { child } => {
                internal!(level = INFO, "Spawned worker {child}");
                Ok(child)
            }
            ForkResult::Child => {
                let code = match Worker::build(&self.config, sockets).and_then(Worker::run) {
                    Ok(()) => 0,
                    Err(err) => {
                        eprintln!("worker: {err}");
                        1
                    }
                };

                exit(code);
            }
        }
    }

    fn watch(&mut self, mask: &SigSet) -> Result<(), SupervisorError> {
        loop {
            let signal = mask.wait().map_err(SupervisorError::Signals)?;

            match signal {
                Sig::SIGCHLD => self.reap()?,
                Sig::SIGTERM | Sig::SIGINT => {
                    internal!(level = INFO, "Shutting down ...");
                    self.stop_children();
                    return Ok(());
                }
                Sig::SIGHUP => self.reload()?,
                // SIGUSR1/SIGUSR2 reserved
                _ => {}
            }
        }
    }

    fn reap(&mut self) -> Result<(), SupervisorError> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, 0)) => {
                    internal!(level = INFO, "Worker {pid} exited");
                    self.children.retain(|child| *child != pid);
                }
                Ok(WaitStatus::Exited(pid, code)) => {
                    internal!(level = WARN, "Worker {pid} exited with {code}, restarting");
                    self.replace(pid)?;
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    internal!(level = WARN, "Worker {pid} killed by {signal}, restarting");
                    self.replace(pid)?;
                }
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => return Ok(()),
                Ok(_) => {}
                Err(err) => return Err(SupervisorError::Signals(err)),
            }
        }
    }

    fn replace(&mut self, died: Pid) -> Result<(), SupervisorError> {
        self.children.retain(|child| *child != died);

        std::thread::sleep(RESTART_BACKOFF);

        let child = self.spawn_worker()?;
        self.children.push(child);

        Ok(())
    }

    fn stop_children(&mut self) {
        for child in &self.children {
            let _ = kill(*child, Sig::SIGTERM);
        }

        for child in self.children.drain(..) {
            let _ = waitpid(child, None);
        }
    }

    /// SIGHUP: re-parse the configuration and replace every worker with one
    /// built from it. The sockets were bound before privileges were dropped
    /// and cannot be rebound now, so listener address changes only take
    /// effect on a full restart.
    fn reload(&mut self) -> Result<(), SupervisorError> {
        let Some(path) = self.config_path.clone() else {
            internal!(level = WARN, "No configuration file to reload");
            return Ok(());
        };

        let config = match Config::load(&path) {
            Ok(config) => config,
            Err(err) => {
                internal!(
                    level = ERROR,
                    "Reload failed, keeping the running configuration: {err}"
                );
                return Ok(());
            }
        };

        for (_, address, spec) in &mut self.sockets {
            if let Some(fresh) = config
                .listeners
                .iter()
                .find(|s| s.host == spec.host && s.port == spec.port && s.tls == spec.tls)
            {
                *spec = fresh.clone();
            } else {
                internal!(
                    level = WARN,
                    "Listener {address} dropped from configuration; the socket stays bound until restart"
                );
            }
        }

        let bound = |candidate: &ListenerSpec| {
            self.sockets.iter().any(|(_, _, spec)| {
                spec.host == candidate.host && spec.port == candidate.port && spec.tls == candidate.tls
            })
        };

        if !config.listeners.iter().all(bound) {
            internal!(
                level = WARN,
                "New listeners in the configuration require a restart to bind"
            );
        }

        self.config = config;

        internal!(level = INFO, "Configuration reloaded, replacing workers");

        self.stop_children();

        for _ in 0..self.config.workers {
            let child = self.spawn_worker()?;
            self.children.push(child);
        }

        Ok(())
    }
}

fn bind_socket(address: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    if address.is_ipv6() {
        // A paired 0.0.0.0:P + [::]:P configuration must be bindable
        socket.set_only_v6(true)?;
    }

    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Detach from the terminal with the classic double fork.
///
/// # Errors
///
/// Fork or session-leader failures.
pub fn daemonize() -> Result<(), SupervisorError> {
    if let ForkResult::Parent { .. } = unsafe { fork() }.map_err(SupervisorError::Fork)? {
        exit(0);
    }

    setsid().map_err(SupervisorError::Daemonize)?;

    if let ForkResult::Parent { .. } = unsafe { fork() }.map_err(SupervisorError::Fork)? {
        exit(0);
    }

    std::env::set_current_dir("/")?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;

    for fd in 0..=2 {
        // SAFETY: replacing stdio with /dev/null; both descriptors are open
        unsafe {
            libc::dup2(devnull.as_raw_fd(), fd);
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::{bind_socket, SupervisorError};
    use crate::config::ConfigError;

    #[test]
    fn exit_codes_stay_in_the_sysexits_range() {
        let config = SupervisorError::Config(ConfigError::NoWorkers);
        assert_eq!(config.exit_code(), 78);

        let bind = SupervisorError::Bind {
            address: "127.0.0.1:25".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(bind.exit_code(), 69);

        let other = SupervisorError::Io(std::io::Error::other("boom"));
        assert!((64..=78).contains(&other.exit_code()));
    }

    #[test]
    fn dual_stack_binding_is_possible() {
        // The v6 socket must not claim the v4 side of the port
        let v6 = bind_socket("[::1]:0".parse().unwrap()).unwrap();
        let port = v6.local_addr().unwrap().port();
        let v4 = bind_socket(format!("127.0.0.1:{port}").parse().unwrap()).unwrap();

        assert_eq!(v4.local_addr().unwrap().port(), port);
    }
}
