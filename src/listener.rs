use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::TcpListener,
    sync::{broadcast, Semaphore},
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    internal,
    smtp::{
        connection::Connection,
        session::{Session, SessionConfig},
    },
    Signal,
};

/// One bound socket and the session configuration every connection accepted
/// from it inherits.
pub struct Listener {
    socket: std::net::TcpListener,
    address: SocketAddr,
    /// Present on TLS-on-connect listeners; the handshake happens before the
    /// banner.
    tls: Option<TlsAcceptor>,
    session: SessionConfig,
    max_sessions: usize,
    /// How long in-flight sessions get to finish once shutdown starts.
    grace: Option<Duration>,
}

impl Listener {
    pub fn new(
        socket: std::net::TcpListener,
        address: SocketAddr,
        tls: Option<TlsAcceptor>,
        session: SessionConfig,
        max_sessions: usize,
        grace: Option<Duration>,
    ) -> Self {
        Self {
            socket,
            address,
            tls,
            session,
            max_sessions,
            grace,
        }
    }

    /// Accept connections until shutdown, handing each to a fresh session.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket cannot be registered with the runtime
    /// or accepting fails in a way that is not known to be transient. Either
    /// way the failure stays confined to this listener.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        let socket = self.socket.try_clone()?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket)?;

        internal!(
            level = INFO,
            "Listening on {} ({}{} mode)",
            self.address,
            if self.tls.is_some() { "TLS, " } else { "" },
            self.session.mode
        );

        let semaphore = Arc::new(Semaphore::new(self.max_sessions));
        let mut sessions = JoinSet::new();

        loop {
            // Opportunistically reap whatever already finished
            while sessions.try_join_next().is_some() {}

            let permit = tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        break;
                    }
                    continue;
                }

                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        break;
                    }
                    continue;
                }

                connection = listener.accept() => match connection {
                    Ok(connection) => connection,
                    Err(err) if transient(&err) => {
                        internal!(level = WARN, "Accept on {} failed: {err}", self.address);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                },
            };

            tracing::debug!("Connection from {peer} on {}", self.address);

            let config = self.session.clone();
            let tls = self.tls.clone();
            let signal = shutdown.resubscribe();

            sessions.spawn(async move {
                let _permit = permit;

                let result = if let Some(acceptor) = tls {
                    match acceptor.accept(stream).await {
                        Ok(stream) => {
                            Session::with_connection(Connection::tls(stream), peer, config)
                                .run(signal)
                                .await
                        }
                        Err(err) => {
                            // The peer gets nothing, not even an error line
                            internal!(level = DEBUG, "TLS handshake with {peer} failed: {err}");
                            return;
                        }
                    }
                } else {
                    Session::create(stream, peer, config).run(signal).await
                };

                if let Err(err) = result {
                    internal!(level = DEBUG, "Session with {peer} ended: {err}");
                }
            });
        }

        internal!(
            level = INFO,
            "Listener {} received shutdown, finishing sessions ...",
            self.address
        );

        let drain = async {
            while sessions.join_next().await.is_some() {}
        };

        match self.grace {
            Some(grace) => {
                // Stragglers are aborted when the set drops
                let _ = tokio::time::timeout(grace, drain).await;
            }
            None => drain.await,
        }

        Ok(())
    }
}

/// Accept failures worth retrying rather than tearing the listener down.
fn transient(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::ConnectionAborted
        || matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE))
}

#[cfg(test)]
mod test {
    use super::transient;

    #[test]
    fn transient_accept_errors() {
        assert!(transient(&std::io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(transient(&std::io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(transient(&std::io::Error::from(
            std::io::ErrorKind::ConnectionAborted
        )));
        assert!(!transient(&std::io::Error::other("boom")));
    }
}
