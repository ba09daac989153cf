//! In-process test harness: boots a listener on an ephemeral port and drives
//! it over real sockets.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::broadcast,
};

use blackhole::{
    config::{Delay, Mode},
    listener::Listener,
    smtp::session::SessionConfig,
    Signal,
};

pub struct SinkBuilder {
    mode: Mode,
    delay: Option<Delay>,
    timeout: Option<Duration>,
    max_message_size: usize,
    dynamic_switch: bool,
}

impl SinkBuilder {
    fn new() -> Self {
        Self {
            mode: Mode::Accept,
            delay: None,
            timeout: Some(Duration::from_secs(30)),
            max_message_size: 512_000,
            dynamic_switch: true,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    #[must_use]
    pub fn with_dynamic_switch(mut self, enabled: bool) -> Self {
        self.dynamic_switch = enabled;
        self
    }

    /// Bind an ephemeral port and start serving on it.
    pub fn start(self) -> Sink {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let address = socket.local_addr().expect("local address");

        let session = SessionConfig {
            banner: Arc::from("sink.test"),
            mode: self.mode,
            delay: self.delay,
            timeout: self.timeout,
            max_message_size: self.max_message_size,
            dynamic_switch: self.dynamic_switch,
            starttls: None,
        };

        let listener = Listener::new(socket, address, None, session, 64, self.timeout);
        let (shutdown, receiver) = broadcast::channel(16);

        tokio::spawn(async move {
            let _ = listener.serve(receiver).await;
        });

        Sink { address, shutdown }
    }
}

pub struct Sink {
    address: SocketAddr,
    shutdown: broadcast::Sender<Signal>,
}

impl Sink {
    #[must_use]
    pub fn builder() -> SinkBuilder {
        SinkBuilder::new()
    }

    pub async fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.address).await.expect("connect");
        Client { stream }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(Signal::Shutdown);
    }
}

pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// The sink greets before anything is sent.
    pub async fn banner(&mut self) -> String {
        self.read_reply().await
    }

    /// Send one command line and collect its (possibly multi-line) reply.
    pub async fn command(&mut self, line: &str) -> String {
        self.write_raw(format!("{line}\r\n").as_bytes()).await;
        self.read_reply().await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
    }

    /// Read until a final reply line (`NNN `, not `NNN-`) has arrived.
    pub async fn read_reply(&mut self) -> String {
        let mut received = String::new();
        let mut buffer = [0; 4096];

        loop {
            let read = self.stream.read(&mut buffer).await.expect("read");
            assert!(
                read > 0,
                "connection closed while awaiting a reply: {received:?}"
            );
            received.push_str(&String::from_utf8_lossy(&buffer[..read]));

            if !received.ends_with("\r\n") {
                continue;
            }

            if let Some(line) = received.trim_end().lines().last() {
                let bytes = line.as_bytes();
                if bytes.len() >= 4
                    && bytes[..3].iter().all(u8::is_ascii_digit)
                    && bytes[3] == b' '
                {
                    return received;
                }
            }
        }
    }

    /// Drain whatever remains until the sink closes the connection.
    pub async fn read_until_close(&mut self) -> Vec<u8> {
        let mut received = Vec::new();
        self.stream
            .read_to_end(&mut received)
            .await
            .expect("read to close");
        received
    }

    /// Run HELO/MAIL/RCPT/DATA and return once the sink is ready for the
    /// message body.
    pub async fn begin_message(&mut self) {
        assert!(self.command("HELO client.test").await.starts_with("250"));
        assert!(
            self.command("MAIL FROM:<sender@example.test>")
                .await
                .starts_with("250")
        );
        assert!(
            self.command("RCPT TO:<victim@example.test>")
                .await
                .starts_with("250")
        );
        assert!(self.command("DATA").await.starts_with("354"));
    }

    /// The three-digit code a reply starts with.
    pub fn code(reply: &str) -> u16 {
        reply[..3].parse().expect("numeric reply code")
    }
}
