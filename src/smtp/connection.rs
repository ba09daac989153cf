use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig, ServerConnection,
    },
    server::TlsStream,
    TlsAcceptor,
};

const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Unable to load TLS certificate {path}: {reason}")]
    CertificateLoad { path: String, reason: String },

    #[error("Unable to load TLS key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("Invalid TLS material: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct TlsInfo {
    version: Option<&'static str>,
    cipher: Option<&'static str>,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn.protocol_version().and_then(|v| v.as_str()),
            cipher: conn
                .negotiated_cipher_suite()
                .and_then(|suite| suite.suite().as_str()),
        }
    }

    #[must_use]
    pub fn proto(&self) -> &'static str {
        self.version.unwrap_or("unknown")
    }

    #[must_use]
    pub fn cipher(&self) -> &'static str {
        self.cipher.unwrap_or("unknown")
    }
}

/// One CRLF-terminated line from the peer, or the marker that a line blew
/// past the limit it was read under (the excess is consumed through the
/// terminator either way).
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    Complete(Vec<u8>),
    TooLong,
}

pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain {
        stream: Stream,
        buffer: Vec<u8>,
    },
    Tls {
        stream: Box<TlsStream<Stream>>,
        buffer: Vec<u8>,
    },
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self::Plain {
            stream,
            buffer: Vec::new(),
        }
    }

    pub fn tls(stream: TlsStream<Stream>) -> Self {
        Self::Tls {
            stream: Box::new(stream),
            buffer: Vec::new(),
        }
    }

    pub(crate) async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> std::io::Result<()> {
        let response = format!("{response}\r\n");

        match self {
            Self::Plain { stream, .. } => stream.write_all(response.as_bytes()).await,
            Self::Tls { stream, .. } => stream.write_all(response.as_bytes()).await,
        }
    }

    /// Read one line, CRLF-terminated with a bare LF accepted leniently.
    ///
    /// The terminator is not part of the returned line. `Ok(None)` means the
    /// peer closed the connection (a partial unterminated line is discarded
    /// with it).
    pub(crate) async fn read_line(&mut self, limit: usize) -> std::io::Result<Option<Line>> {
        let mut discarding = false;

        loop {
            if let Some(pos) = self.buffer().iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer_mut().drain(..=pos).collect();

                if discarding {
                    return Ok(Some(Line::TooLong));
                }

                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                return Ok(Some(if line.len() > limit {
                    Line::TooLong
                } else {
                    Line::Complete(line)
                }));
            }

            // No terminator buffered yet; stop hoarding input that can no
            // longer become a valid line
            if self.buffer().len() > limit {
                self.buffer_mut().clear();
                discarding = true;
            }

            let mut chunk = [0; BUFFER_SIZE];
            let read = match self {
                Self::Plain { stream, .. } => stream.read(&mut chunk).await?,
                Self::Tls { stream, .. } => stream.read(&mut chunk).await?,
            };

            if read == 0 {
                return Ok(None);
            }

            self.buffer_mut().extend_from_slice(&chunk[..read]);
        }
    }

    /// Negotiate TLS over an established cleartext connection.
    pub(crate) async fn upgrade(self, acceptor: &TlsAcceptor) -> Result<(Self, TlsInfo), TlsError> {
        match self {
            Self::Plain { stream, buffer } => {
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1);

                Ok((
                    Self::Tls {
                        stream: Box::new(stream),
                        buffer,
                    },
                    info,
                ))
            }
            Self::Tls { .. } => Err(TlsError::Handshake(std::io::Error::other(
                "TLS is already active on this connection",
            ))),
        }
    }

    fn buffer(&self) -> &Vec<u8> {
        match self {
            Self::Plain { buffer, .. } | Self::Tls { buffer, .. } => buffer,
        }
    }

    fn buffer_mut(&mut self) -> &mut Vec<u8> {
        match self {
            Self::Plain { buffer, .. } | Self::Tls { buffer, .. } => buffer,
        }
    }
}

fn load_certs<P: AsRef<Path>>(path: &P) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let path_str = path.as_ref().display().to_string();
    let file = File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?;

    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad {
            path: path_str,
            reason: e.to_string(),
        })
}

fn load_key<P: AsRef<Path>>(path: &P) -> Result<PrivateKeyDer<'static>, TlsError> {
    let path_str = path.as_ref().display().to_string();
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

/// Build the server-side TLS configuration shared by every session of a
/// worker.
///
/// # Errors
///
/// Unreadable or unusable certificate or key material.
pub fn tls_config<P: AsRef<Path>>(certificate: &P, key: &P) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(certificate)?;
    let key = load_key(key)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}
