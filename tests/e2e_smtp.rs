//! End-to-end protocol tests: a listener on an ephemeral port driven over
//! real sockets, one scenario per conversation a mail client might hold.

mod support;

use std::time::{Duration, Instant};

use blackhole::{
    config::{Delay, Mode},
    smtp::policy::BOUNCE_CODES,
};
use support::{Client, Sink};

#[tokio::test]
async fn banner_then_quit() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    let banner = client.banner().await;
    assert!(banner.starts_with("220 "), "{banner}");
    assert!(banner.contains("ESMTP Blackhole"));
    assert!(banner.ends_with("\r\n"));

    let reply = client.command("QUIT").await;
    assert!(reply.starts_with("221 "), "{reply}");

    assert!(client.read_until_close().await.is_empty());
}

#[tokio::test]
async fn accept_happy_path() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;

    client.write_raw(b"Subject: t\r\n\r\nhi\r\n.\r\n").await;
    let reply = client.read_reply().await;

    let id = reply
        .trim_end()
        .strip_prefix("250 OK: queued as ")
        .unwrap_or_else(|| panic!("unexpected reply {reply:?}"));
    assert_eq!(id.len(), 16);
    assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
}

#[tokio::test]
async fn several_messages_share_one_session() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    client.banner().await;
    assert!(client.command("HELO client.test").await.starts_with("250"));

    for _ in 0..3 {
        assert!(
            client
                .command("MAIL FROM:<sender@example.test>")
                .await
                .starts_with("250")
        );
        assert!(
            client
                .command("RCPT TO:<victim@example.test>")
                .await
                .starts_with("250")
        );
        assert!(client.command("DATA").await.starts_with("354"));

        client.write_raw(b"hello\r\n.\r\n").await;
        assert!(client.read_reply().await.starts_with("250 OK: queued as "));
    }

    assert!(client.command("QUIT").await.starts_with("221"));
}

#[tokio::test]
async fn bounce_mode_draws_from_the_bounce_codes() {
    let sink = Sink::builder().with_mode(Mode::Bounce).start();
    let mut client = sink.connect().await;

    client.banner().await;
    assert!(client.command("HELO client.test").await.starts_with("250"));

    let mut seen = std::collections::HashSet::new();

    for _ in 0..50 {
        client.command("MAIL FROM:<sender@example.test>").await;
        client.command("RCPT TO:<victim@example.test>").await;
        client.command("DATA").await;
        client.write_raw(b"hi\r\n.\r\n").await;

        let reply = client.read_reply().await;
        let code = Client::code(&reply);

        assert!(
            BOUNCE_CODES.iter().any(|status| *status as u16 == code),
            "{reply}"
        );
        seen.insert(code);
    }

    // Uniform over ten codes, fifty draws: a single repeated code would be
    // one-in-ten to the forty-ninth
    assert!(seen.len() > 1, "only saw {seen:?}");
}

#[tokio::test]
async fn dynamic_switch_overrides_the_listener_mode() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;

    client
        .write_raw(b"X-Blackhole-Mode: bounce\r\nSubject: t\r\n\r\nhi\r\n.\r\n")
        .await;

    let reply = client.read_reply().await;
    assert!(Client::code(&reply) >= 400, "{reply}");
}

#[tokio::test]
async fn dynamic_switch_can_take_the_session_offline() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;

    client
        .write_raw(b"X-Blackhole-Mode: offline\r\n\r\nhi\r\n.\r\n")
        .await;

    let reply = client.read_reply().await;
    assert!(reply.starts_with("421 "), "{reply}");

    // The closing notice is followed by the socket closing
    assert!(client.read_until_close().await.is_empty());
}

#[tokio::test]
async fn dynamic_switch_can_be_disabled() {
    let sink = Sink::builder().with_dynamic_switch(false).start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;

    client
        .write_raw(b"X-Blackhole-Mode: bounce\r\n\r\nhi\r\n.\r\n")
        .await;

    let reply = client.read_reply().await;
    assert!(reply.starts_with("250 "), "{reply}");
}

#[tokio::test]
async fn dot_stuffing_strips_one_leading_dot() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;

    // The stored first line must read `X-Blackhole-Mode: bounce` for the
    // switch to see it; the wire form carries the transparency dot
    client
        .write_raw(b".X-Blackhole-Mode: bounce\r\n\r\nhi\r\n.\r\n")
        .await;

    let reply = client.read_reply().await;
    assert!(Client::code(&reply) >= 400, "{reply}");
}

#[tokio::test]
async fn a_dot_dot_line_does_not_end_the_message() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;

    client.write_raw(b"..\r\nstill the body\r\n.\r\n").await;
    assert!(client.read_reply().await.starts_with("250 "));

    // The session is intact afterwards
    assert!(client.command("NOOP").await.starts_with("250"));
}

#[tokio::test]
async fn message_size_boundary() {
    // Stored form of the body is `aaaa...\r\n`; 62 payload bytes hit the cap
    // exactly
    let sink = Sink::builder().with_max_message_size(64).start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;
    client.write_raw(&[b'a'; 62]).await;
    client.write_raw(b"\r\n.\r\n").await;
    assert!(client.read_reply().await.starts_with("250 "), "exact limit");

    // One byte more must be refused, after the terminator arrives
    client.command("MAIL FROM:<sender@example.test>").await;
    client.command("RCPT TO:<victim@example.test>").await;
    client.command("DATA").await;
    client.write_raw(&[b'a'; 63]).await;
    client.write_raw(b"\r\n.\r\n").await;

    let reply = client.read_reply().await;
    assert!(reply.starts_with("552 "), "{reply}");

    // And the session survives the refusal
    assert!(client.command("NOOP").await.starts_with("250"));
}

#[tokio::test]
async fn oversize_message_is_consumed_then_refused() {
    let sink = Sink::builder().with_max_message_size(1000).start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;

    for _ in 0..101 {
        client.write_raw(b"aaaaaaaa\r\n").await;
    }
    client.write_raw(b".\r\n").await;

    let reply = client.read_reply().await;
    assert!(reply.starts_with("552 "), "{reply}");
}

#[tokio::test]
async fn rset_leaves_a_clean_envelope() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    client.banner().await;
    assert!(client.command("HELO client.test").await.starts_with("250"));

    for _ in 0..4 {
        assert!(client.command("RSET").await.starts_with("250"));
    }

    // Still ready for a fresh transaction
    assert!(
        client
            .command("MAIL FROM:<sender@example.test>")
            .await
            .starts_with("250")
    );

    // And RCPT without a preceding MAIL is refused after another RSET
    assert!(client.command("RSET").await.starts_with("250"));
    assert!(
        client
            .command("RCPT TO:<victim@example.test>")
            .await
            .starts_with("503")
    );
}

#[tokio::test]
async fn idle_connections_hear_421_then_lose_the_socket() {
    let sink = Sink::builder()
        .with_timeout(Some(Duration::from_secs(1)))
        .start();
    let mut client = sink.connect().await;

    client.banner().await;

    let received = client.read_until_close().await;
    assert_eq!(received, b"421 Timeout\r\n");
}

#[tokio::test]
async fn offline_mode_closes_with_no_bytes() {
    let sink = Sink::builder().with_mode(Mode::Offline).start();
    let mut client = sink.connect().await;

    assert!(client.read_until_close().await.is_empty());
}

#[tokio::test]
async fn reply_waits_for_the_configured_delay() {
    let sink = Sink::builder().with_delay(Delay::Fixed(1)).start();
    let mut client = sink.connect().await;

    client.banner().await;
    client.begin_message().await;

    let start = Instant::now();
    client.write_raw(b"hi\r\n.\r\n").await;
    let reply = client.read_reply().await;
    let elapsed = start.elapsed();

    assert!(reply.starts_with("250 "), "{reply}");
    assert!(elapsed >= Duration::from_secs(1), "replied after {elapsed:?}");
}

#[tokio::test]
async fn delayed_sessions_do_not_serialise() {
    let sink = Sink::builder().with_delay(Delay::Fixed(2)).start();

    let start = Instant::now();

    let sessions = (0..5).map(|_| async {
        let mut client = sink.connect().await;
        client.banner().await;
        client.begin_message().await;
        client.write_raw(b"hi\r\n.\r\n").await;
        assert!(client.read_reply().await.starts_with("250 "));
    });

    futures_util::future::join_all(sessions).await;

    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(4),
        "five delayed sessions took {elapsed:?}"
    );
}

#[tokio::test]
async fn shutdown_notifies_connected_clients() {
    let sink = Sink::builder().start();
    let mut client = sink.connect().await;

    client.banner().await;
    sink.shutdown();

    let received = client.read_until_close().await;
    assert!(String::from_utf8_lossy(&received).starts_with("421 "));
}
