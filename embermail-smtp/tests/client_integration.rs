//! End-to-end integration tests driving a real [`Listener`] over a TCP
//! socket with a plain `tokio::net::TcpStream`, one raw command line at a
//! time, the way an actual SMTP client would.

use std::time::Duration;

use embermail_smtp::{extensions::Extension, listener::Listener, SmtpConfig};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};

/// Starts a listener on a random port with a noop processor and no auth,
/// returning the port and a handle that can be dropped to let the listener
/// task run out its course once the test's shutdown sender is dropped.
async fn start_test_server() -> (u16, tokio::sync::broadcast::Sender<embermail_common::Signal>) {
    let bound = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = bound.local_addr().unwrap();
    drop(bound);

    let config = SmtpConfig::builder()
        .with_extensions(vec![Extension::Size(10_000_000)])
        .build();
    let listener = Listener::new(addr, config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        let _ = listener.serve(shutdown_rx).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr.port(), shutdown_tx)
}

struct TestClient {
    stream: BufReader<TcpStream>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Reads one SMTP response, following continuation lines (`250-...`)
    /// until a line with a space separator closes the reply.
    async fn read_response(&mut self) -> (u16, String) {
        let mut code = 0u16;
        let mut text = String::new();
        loop {
            let mut line = String::new();
            timeout(Duration::from_secs(5), self.stream.read_line(&mut line))
                .await
                .expect("response line did not arrive in time")
                .expect("socket read failed");
            let line = line.trim_end_matches(['\r', '\n']);
            code = line[..3].parse().expect("response line starts with a code");
            text.push_str(&line[4..]);
            if line.as_bytes().get(3) == Some(&b' ') {
                break;
            }
            text.push('\n');
        }
        (code, text)
    }

    async fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn command(&mut self, line: &str) -> (u16, String) {
        self.send(line).await;
        self.read_response().await
    }
}

#[tokio::test]
async fn test_basic_connection() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;

    let (code, _) = client.read_response().await;
    assert_eq!(code, 220);
}

#[tokio::test]
async fn test_ehlo() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;

    let (code, text) = client.command("EHLO test.example.com").await;
    assert_eq!(code, 250);
    assert!(text.contains("SIZE"));
}

#[tokio::test]
async fn test_helo() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;

    let (code, _) = client.command("HELO test.example.com").await;
    assert_eq!(code, 250);
}

#[tokio::test]
async fn test_mail_from() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;

    let (code, _) = client.command("MAIL FROM:<sender@example.com>").await;
    assert_eq!(code, 250);

    let (code, _) = client.command("QUIT").await;
    assert_eq!(code, 221);
}

#[tokio::test]
async fn test_mail_from_with_size() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;

    let (code, _) = client
        .command("MAIL FROM:<sender@example.com> SIZE=1000")
        .await;
    assert_eq!(code, 250);
}

#[tokio::test]
async fn test_rcpt_to() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;
    client.command("MAIL FROM:<sender@example.com>").await;

    let (code, _) = client.command("RCPT TO:<recipient@example.com>").await;
    assert_eq!(code, 250);

    let (code, _) = client.command("QUIT").await;
    assert_eq!(code, 221);
}

#[tokio::test]
async fn test_multiple_recipients() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;
    client.command("MAIL FROM:<sender@example.com>").await;

    let mut successes = 0;
    for rcpt in ["user1@example.com", "user2@example.com", "user3@example.com"] {
        let (code, _) = client.command(&format!("RCPT TO:<{rcpt}>")).await;
        if code == 250 {
            successes += 1;
        }
    }
    assert_eq!(successes, 3);
}

#[tokio::test]
async fn test_complete_transaction() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;
    client.command("MAIL FROM:<sender@example.com>").await;
    client.command("RCPT TO:<recipient@example.com>").await;

    let (code, _) = client.command("DATA").await;
    assert_eq!(code, 354);

    client.send("Subject: Test Email").await;
    client.send("").await;
    client.send("This is a test message.").await;
    let (code, _) = client.command(".").await;
    assert_eq!(code, 250);
}

#[tokio::test]
async fn test_full_session_with_quit() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;
    client.command("MAIL FROM:<sender@example.com>").await;
    client.command("RCPT TO:<recipient@example.com>").await;
    client.command("DATA").await;
    client.send("Subject: Test").await;
    client.send("").await;
    client.send("Hello World").await;
    client.command(".").await;

    let (code, _) = client.command("QUIT").await;
    assert_eq!(code, 221);
}

#[tokio::test]
async fn test_rset_command() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;
    client.command("MAIL FROM:<sender@example.com>").await;
    client.command("RCPT TO:<recipient@example.com>").await;

    let (code, _) = client.command("RSET").await;
    assert_eq!(code, 250);

    let (code, _) = client.command("MAIL FROM:<newsender@example.com>").await;
    assert_eq!(code, 250);
}

#[tokio::test]
async fn test_unknown_command() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;

    let (code, _) = client.command("FROBNICATE").await;
    assert_eq!(code, 500);
}

#[tokio::test]
async fn test_size_exceeded() {
    let (port, _shutdown) = start_test_server().await;
    let mut client = TestClient::connect(port).await;
    client.read_response().await;
    client.command("EHLO test.example.com").await;

    let (code, _) = client
        .command("MAIL FROM:<sender@example.com> SIZE=10")
        .await;
    assert_eq!(code, 250);
    client.command("RCPT TO:<recipient@example.com>").await;

    let (code, _) = client.command("DATA").await;
    assert_eq!(code, 354);

    client.send("this line is well past the ten declared bytes").await;
    let (code, _) = client.read_response().await;
    assert_eq!(code, 552);
}
