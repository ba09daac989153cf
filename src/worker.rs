use std::{net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal as Sig};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::broadcast,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::{Config, ListenerSpec},
    internal,
    listener::Listener,
    smtp::{connection, session::SessionConfig},
    Signal,
};

/// One forked process: a set of listeners multiplexed on a runtime of its
/// own, sharing nothing with its siblings.
pub struct Worker {
    listeners: Vec<Listener>,
}

impl Worker {
    /// Assemble listeners from the supervisor-bound sockets and the parsed
    /// configuration, resolving each listener's effective mode and delay.
    ///
    /// # Errors
    ///
    /// TLS material that cannot be loaded.
    pub fn build(
        config: &Config,
        sockets: Vec<(std::net::TcpListener, SocketAddr, ListenerSpec)>,
    ) -> anyhow::Result<Self> {
        let banner: Arc<str> = hostname().into();

        let tls = match (&config.tls_cert, &config.tls_key) {
            (Some(certificate), Some(key)) => Some(TlsAcceptor::from(connection::tls_config(
                certificate,
                key,
            )?)),
            _ => None,
        };

        if config.tls_dhparams.is_some() {
            internal!(
                level = INFO,
                "tls_dhparams accepted for compatibility; rustls manages ephemeral key exchange"
            );
        }

        let listeners = sockets
            .into_iter()
            .map(|(socket, address, spec)| {
                let session = SessionConfig {
                    banner: Arc::clone(&banner),
                    mode: config.mode_for(&spec),
                    delay: config.delay_for(&spec),
                    timeout: config.timeout(),
                    max_message_size: config.max_message_size,
                    dynamic_switch: config.dynamic_switch,
                    starttls: if !spec.tls && config.starttls {
                        tls.clone()
                    } else {
                        None
                    },
                };

                Listener::new(
                    socket,
                    address,
                    if spec.tls { tls.clone() } else { None },
                    session,
                    config.max_sessions,
                    config.timeout(),
                )
            })
            .collect();

        Ok(Self { listeners })
    }

    /// The forked child's entry point: release the signals the supervisor
    /// keeps blocked for itself, build this process's runtime, and serve.
    ///
    /// # Errors
    ///
    /// Runtime construction or signal setup failures.
    pub fn run(self) -> anyhow::Result<()> {
        sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&supervised_signals()), None)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        runtime.block_on(self.serve())
    }

    async fn serve(self) -> anyhow::Result<()> {
        let (sender, _) = broadcast::channel(16);

        tokio::spawn(watch_signals(sender.clone()));

        internal!(
            level = INFO,
            "Worker {} serving {} listener(s)",
            std::process::id(),
            self.listeners.len()
        );

        let results = join_all(
            self.listeners
                .iter()
                .map(|listener| listener.serve(sender.subscribe())),
        )
        .await;

        // A listener failure never outlives the worker's other listeners
        for result in results {
            if let Err(err) = result {
                internal!(level = ERROR, "Listener failed: {err}");
            }
        }

        internal!(level = INFO, "Worker {} finished", std::process::id());

        Ok(())
    }
}

/// The signals the supervisor blocks and waits on; a worker handles them
/// through its runtime instead.
pub(crate) fn supervised_signals() -> SigSet {
    let mut mask = SigSet::empty();

    for signal in [
        Sig::SIGTERM,
        Sig::SIGINT,
        Sig::SIGHUP,
        Sig::SIGCHLD,
        Sig::SIGUSR1,
        Sig::SIGUSR2,
    ] {
        mask.add(signal);
    }

    mask
}

async fn watch_signals(sender: broadcast::Sender<Signal>) {
    let handlers = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    );

    let (Ok(mut term), Ok(mut int), Ok(mut hup), Ok(mut usr1), Ok(mut usr2)) = handlers else {
        internal!(level = ERROR, "Unable to install signal handlers");
        return;
    };

    loop {
        tokio::select! {
            _ = term.recv() => break,
            _ = int.recv() => break,
            // No live reload; the supervisor replaces this process with one
            // built from fresh configuration
            _ = hup.recv() => break,
            // Reserved
            _ = usr1.recv() => {}
            _ = usr2.recv() => {}
        }
    }

    internal!(level = INFO, "Worker {} shutting down", std::process::id());
    let _ = sender.send(Signal::Shutdown);
}

fn hostname() -> String {
    nix::unistd::gethostname().map_or_else(
        |_| "localhost".to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}
