//! Integration tests for the network transport against scripted servers on
//! the loopback interface.

#![cfg(all(feature = "imap", feature = "smtp"))]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::similar_names)]

use std::sync::{Arc, Mutex};

use mailconn::{
    ConnectionConfig, ConnectionRegistry, ErrorKind, MailboxQuery, MimeParser, NetworkTransport,
    OutgoingMessage, Protocol, delete_message, list_messages, send_message,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const USER: &str = "support@example.com";
const PASSWORD: &str = "s3cret";

type Log = Arc<Mutex<Vec<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn raw(n: u32) -> Vec<u8> {
    format!(
        "From: Customer <customer@example.org>\r\n\
         To: {USER}\r\n\
         Subject: message {n}\r\n\
         Message-ID: <{n}@example.org>\r\n\
         \r\n\
         Body of message {n}\r\n"
    )
    .into_bytes()
}

fn registry_for(config: &ConnectionConfig) -> ConnectionRegistry {
    init_tracing();
    let registry = ConnectionRegistry::new(Arc::new(NetworkTransport::new()));
    registry.create_connection(config).unwrap();
    registry
}

fn config(name: &str, port: u16, protocol: Protocol) -> ConnectionConfig {
    ConnectionConfig::builder(name, "127.0.0.1", port, protocol)
        .credentials(USER, PASSWORD)
        .build()
}

/// Accepts connections forever, serving each with `serve`.
async fn listen<F, Fut>(serve: F) -> u16
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket));
        }
    });
    port
}

// IMAP

#[derive(Debug, Clone)]
struct Stored {
    uid: u32,
    flags: Vec<String>,
    raw: Vec<u8>,
}

#[derive(Debug, Default)]
struct Mailbox {
    messages: Vec<Stored>,
    commands: Vec<String>,
}

type SharedMailbox = Arc<Mutex<Mailbox>>;

fn mailbox_with(count: u32) -> SharedMailbox {
    let messages = (1..=count)
        .map(|uid| Stored {
            uid,
            flags: Vec::new(),
            raw: raw(uid),
        })
        .collect();
    Arc::new(Mutex::new(Mailbox {
        messages,
        commands: Vec::new(),
    }))
}

fn parse_uids(set: &str) -> Vec<u32> {
    set.split(',').filter_map(|u| u.parse().ok()).collect()
}

fn matches_key(message: &Stored, key: &str) -> bool {
    let has = |flag: &str| message.flags.iter().any(|f| f == flag);
    match key {
        "SEEN" => has("\\Seen"),
        "UNSEEN" => !has("\\Seen"),
        "DELETED" => has("\\Deleted"),
        "UNDELETED" => !has("\\Deleted"),
        _ => true,
    }
}

fn fetch_response(seq: usize, message: &Stored, items: &str) -> Vec<u8> {
    let mut out = format!("* {seq} FETCH (UID {} ", message.uid).into_bytes();
    if items.contains("BODY.PEEK[HEADER]") {
        let end = message
            .raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(message.raw.len(), |p| p + 4);
        let header = &message.raw[..end];
        out.extend_from_slice(
            format!(
                "FLAGS ({}) INTERNALDATE \"17-Jul-2024 02:44:25 +0000\" BODY[HEADER] {{{}}}\r\n",
                message.flags.join(" "),
                header.len()
            )
            .as_bytes(),
        );
        out.extend_from_slice(header);
    } else {
        out.extend_from_slice(format!("BODY[] {{{}}}\r\n", message.raw.len()).as_bytes());
        out.extend_from_slice(&message.raw);
    }
    out.extend_from_slice(b")\r\n");
    out
}

/// Answers one IMAP command, returning untagged data and the tagged status.
fn imap_reply(mailbox: &SharedMailbox, writable: &mut bool, command: &str) -> (Vec<u8>, String) {
    let mut state = mailbox.lock().unwrap();
    state.commands.push(command.to_string());
    let (verb, args) = command.split_once(' ').unwrap_or((command, ""));
    let mut data = Vec::new();

    let status = match verb.to_ascii_uppercase().as_str() {
        "CAPABILITY" => {
            data.extend_from_slice(b"* CAPABILITY IMAP4rev1\r\n");
            "OK CAPABILITY completed".to_string()
        }
        "LOGIN" if args == format!("\"{USER}\" \"{PASSWORD}\"") => "OK LOGIN completed".to_string(),
        "LOGIN" => "NO [AUTHENTICATIONFAILED] invalid credentials".to_string(),
        "NOOP" => "OK NOOP completed".to_string(),
        "SELECT" | "EXAMINE" if args.trim_matches('"').eq_ignore_ascii_case("INBOX") => {
            *writable = verb.eq_ignore_ascii_case("SELECT");
            data.extend_from_slice(
                format!(
                    "* {} EXISTS\r\n* 0 RECENT\r\n* OK [UIDVALIDITY 7] UIDs valid\r\n",
                    state.messages.len()
                )
                .as_bytes(),
            );
            let access = if *writable { "READ-WRITE" } else { "READ-ONLY" };
            format!("OK [{access}] {verb} completed")
        }
        "SELECT" | "EXAMINE" => "NO no such mailbox".to_string(),
        "UID" => {
            let (sub, rest) = args.split_once(' ').unwrap_or((args, ""));
            match sub.to_ascii_uppercase().as_str() {
                "SEARCH" => {
                    let keys: Vec<String> =
                        rest.split_whitespace().map(str::to_ascii_uppercase).collect();
                    let found: Vec<String> = state
                        .messages
                        .iter()
                        .filter(|m| keys.iter().all(|k| matches_key(m, k)))
                        .map(|m| m.uid.to_string())
                        .collect();
                    let line = if found.is_empty() {
                        "* SEARCH\r\n".to_string()
                    } else {
                        format!("* SEARCH {}\r\n", found.join(" "))
                    };
                    data.extend_from_slice(line.as_bytes());
                    "OK SEARCH completed".to_string()
                }
                "FETCH" => {
                    let (set, items) = rest.split_once(' ').unwrap_or((rest, ""));
                    let wanted = parse_uids(set);
                    for (i, message) in state.messages.iter().enumerate() {
                        if wanted.contains(&message.uid) {
                            data.extend(fetch_response(i + 1, message, items));
                        }
                    }
                    "OK FETCH completed".to_string()
                }
                "STORE" => {
                    let mut parts = rest.splitn(3, ' ');
                    let wanted = parse_uids(parts.next().unwrap_or_default());
                    let op = parts.next().unwrap_or_default();
                    let flags: Vec<String> = parts
                        .next()
                        .unwrap_or_default()
                        .trim_matches(['(', ')'])
                        .split_whitespace()
                        .map(str::to_string)
                        .collect();
                    for message in state.messages.iter_mut().filter(|m| wanted.contains(&m.uid)) {
                        message.flags.retain(|f| !flags.contains(f));
                        if op.starts_with('+') {
                            message.flags.extend(flags.iter().cloned());
                        }
                    }
                    "OK STORE completed".to_string()
                }
                _ => "BAD unknown UID command".to_string(),
            }
        }
        "CLOSE" => {
            if *writable {
                state
                    .messages
                    .retain(|m| !m.flags.iter().any(|f| f == "\\Deleted"));
            }
            *writable = false;
            "OK CLOSE completed".to_string()
        }
        "LOGOUT" => {
            data.extend_from_slice(b"* BYE logging out\r\n");
            "OK LOGOUT completed".to_string()
        }
        _ => "BAD unknown command".to_string(),
    };
    (data, status)
}

async fn serve_imap(socket: TcpStream, mailbox: SharedMailbox) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    write
        .write_all(b"* OK [CAPABILITY IMAP4rev1] loopback ready\r\n")
        .await
        .unwrap();
    let mut writable = false;
    while let Ok(Some(line)) = lines.next_line().await {
        let Some((tag, command)) = line.split_once(' ') else {
            continue;
        };
        let (data, status) = imap_reply(&mailbox, &mut writable, command);
        let mut reply = data;
        reply.extend_from_slice(format!("{tag} {status}\r\n").as_bytes());
        if write.write_all(&reply).await.is_err() {
            return;
        }
        if command.eq_ignore_ascii_case("LOGOUT") {
            return;
        }
    }
}

async fn imap_server(mailbox: &SharedMailbox) -> u16 {
    let mailbox = Arc::clone(mailbox);
    listen(move |socket| serve_imap(socket, Arc::clone(&mailbox))).await
}

#[tokio::test]
async fn test_imap_list_and_delete() {
    let mailbox = mailbox_with(3);
    let port = imap_server(&mailbox).await;
    let registry = registry_for(&config("in", port, Protocol::Imap));
    let pool = registry.get_connection_pool("in").unwrap();
    let conn = pool.borrow().await.unwrap();

    let messages = list_messages(&conn, &MailboxQuery::default(), &MimeParser)
        .await
        .unwrap();
    let subjects: Vec<_> = messages.iter().map(|m| m.subject.as_str()).collect();
    assert_eq!(subjects, vec!["message 1", "message 2", "message 3"]);
    assert_eq!(messages[0].from, "Customer <customer@example.org>");

    let id = messages[1].id.clone();
    assert!(delete_message(&conn, "INBOX", &id).await.unwrap());

    let left = list_messages(&conn, &MailboxQuery::default(), &MimeParser)
        .await
        .unwrap();
    assert_eq!(left.len(), 2);
    assert!(left.iter().all(|m| m.id != id));

    let state = mailbox.lock().unwrap();
    assert_eq!(state.messages.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![1, 3]);
    assert!(state.commands.iter().any(|c| c == "UID STORE 2 +FLAGS.SILENT (\\Deleted)"));
    assert!(state.commands.iter().any(|c| c.starts_with("EXAMINE")));
    assert!(state.commands.iter().any(|c| c.starts_with("SELECT")));
}

#[tokio::test]
async fn test_imap_flag_filters_run_on_server() {
    let mailbox = mailbox_with(3);
    mailbox.lock().unwrap().messages[0].flags.push("\\Seen".into());
    let port = imap_server(&mailbox).await;
    let registry = registry_for(&config("in", port, Protocol::Imap));
    let pool = registry.get_connection_pool("in").unwrap();
    let conn = pool.borrow().await.unwrap();

    let query = MailboxQuery {
        seen: Some(false),
        ..MailboxQuery::default()
    };
    let unread = list_messages(&conn, &query, &MimeParser).await.unwrap();
    assert_eq!(unread.len(), 2);
    assert_eq!(unread[0].subject, "message 2");

    let state = mailbox.lock().unwrap();
    assert!(state.commands.iter().any(|c| c == "UID SEARCH UNSEEN"));
    assert!(!state.commands.iter().any(|c| c.contains("BODY.PEEK[HEADER]")));
}

#[tokio::test]
async fn test_imap_missing_folder() {
    let mailbox = mailbox_with(1);
    let port = imap_server(&mailbox).await;
    let registry = registry_for(&config("in", port, Protocol::Imap));
    let pool = registry.get_connection_pool("in").unwrap();
    let conn = pool.borrow().await.unwrap();

    let err = list_messages(&conn, &MailboxQuery::for_folder("Archive"), &MimeParser)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
    assert!(err.to_string().contains("Archive"), "{err}");
}

// SMTP

async fn serve_smtp(socket: TcpStream, transcript: Log, reject_rcpt: bool) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    write
        .write_all(b"220 localhost ESMTP loopback\r\n")
        .await
        .unwrap();
    let mut in_data = false;
    while let Ok(Some(line)) = lines.next_line().await {
        transcript.lock().unwrap().push(line.clone());
        if in_data {
            if line == "." {
                in_data = false;
                write.write_all(b"250 2.0.0 queued\r\n").await.unwrap();
            }
            continue;
        }
        let verb = line
            .split([' ', ':'])
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        let reply: &[u8] = match verb.as_str() {
            "EHLO" => b"250-localhost\r\n250 AUTH PLAIN LOGIN\r\n",
            "AUTH" => b"235 2.7.0 authenticated\r\n",
            "RCPT" if reject_rcpt => b"550 5.1.1 no such user\r\n",
            "MAIL" | "RCPT" | "RSET" | "NOOP" => b"250 2.1.0 ok\r\n",
            "DATA" => {
                in_data = true;
                b"354 end data with <CR><LF>.<CR><LF>\r\n"
            }
            "QUIT" => {
                let _ = write.write_all(b"221 2.0.0 bye\r\n").await;
                return;
            }
            _ => b"502 5.5.2 unknown command\r\n",
        };
        if write.write_all(reply).await.is_err() {
            return;
        }
    }
}

async fn smtp_server(transcript: &Log, reject_rcpt: bool) -> u16 {
    let transcript = Arc::clone(transcript);
    listen(move |socket| serve_smtp(socket, Arc::clone(&transcript), reject_rcpt)).await
}

fn outgoing() -> OutgoingMessage {
    OutgoingMessage::new(
        Some(USER.to_string()),
        vec!["customer@example.org".to_string()],
        b"From: support@example.com\r\nTo: customer@example.org\r\nSubject: Loopback\r\n\r\n.hidden dot\r\n"
            .to_vec(),
    )
}

#[tokio::test]
async fn test_smtp_send() {
    let transcript = Log::default();
    let port = smtp_server(&transcript, false).await;
    let registry = registry_for(&config("out", port, Protocol::Smtp));
    let out = registry.get_connection("out").unwrap();

    send_message(&out, &outgoing()).await.unwrap();

    let lines = transcript.lock().unwrap().clone();
    assert!(lines.iter().any(|l| l.starts_with("AUTH PLAIN")), "{lines:?}");
    assert!(lines.iter().any(|l| l.starts_with(&format!("MAIL FROM:<{USER}>"))), "{lines:?}");
    assert!(lines.iter().any(|l| l.starts_with("RCPT TO:<customer@example.org>")), "{lines:?}");
    assert!(lines.iter().any(|l| l == "Subject: Loopback"), "{lines:?}");
    assert!(lines.iter().any(|l| l == "..hidden dot"), "{lines:?}");
}

#[tokio::test]
async fn test_smtp_rejected_recipient() {
    let transcript = Log::default();
    let port = smtp_server(&transcript, true).await;
    let registry = registry_for(&config("out", port, Protocol::Smtp));
    let out = registry.get_connection("out").unwrap();

    let err = send_message(&out, &outgoing()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
    assert!(err.to_string().contains("no such user"), "{err}");
    assert!(!transcript.lock().unwrap().iter().any(|l| l == "DATA"));
}

// POP3

#[derive(Debug, Default)]
struct Maildrop {
    messages: Vec<Option<Vec<u8>>>,
    commands: Vec<String>,
}

fn dot_block(data: &[u8]) -> Vec<u8> {
    let mut out = b"+OK\r\n".to_vec();
    let data = data.strip_suffix(b"\r\n").unwrap_or(data);
    for line in data.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

async fn serve_pop3(socket: TcpStream, maildrop: Arc<Mutex<Maildrop>>) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"+OK POP3 loopback ready\r\n").await.unwrap();
    let mut deleted: Vec<usize> = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let reply = {
            let mut state = maildrop.lock().unwrap();
            state.commands.push(line.clone());
            let mut words = line.split_whitespace();
            let verb = words.next().unwrap_or_default().to_ascii_uppercase();
            let index = words
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .and_then(|n| n.checked_sub(1));
            let live = index.is_some_and(|i| {
                !deleted.contains(&i) && state.messages.get(i).is_some_and(Option::is_some)
            });
            match (verb.as_str(), index) {
                ("USER", _) => b"+OK\r\n".to_vec(),
                ("PASS", _) if line == format!("PASS {PASSWORD}") => b"+OK logged in\r\n".to_vec(),
                ("PASS", _) => b"-ERR [AUTH] invalid password\r\n".to_vec(),
                ("STAT", _) => format!("+OK {} 0\r\n", state.messages.len()).into_bytes(),
                ("NOOP", _) => b"+OK\r\n".to_vec(),
                ("TOP" | "RETR", Some(i)) if live => {
                    let raw = state.messages[i].clone().unwrap_or_default();
                    if verb == "TOP" {
                        let end = raw
                            .windows(4)
                            .position(|w| w == b"\r\n\r\n")
                            .map_or(raw.len(), |p| p + 4);
                        dot_block(&raw[..end])
                    } else {
                        dot_block(&raw)
                    }
                }
                ("DELE", Some(i)) if live => {
                    deleted.push(i);
                    b"+OK marked\r\n".to_vec()
                }
                ("RSET", _) => {
                    deleted.clear();
                    b"+OK\r\n".to_vec()
                }
                ("QUIT", _) => {
                    for &i in &deleted {
                        state.messages[i] = None;
                    }
                    state.messages.retain(Option::is_some);
                    b"+OK bye\r\n".to_vec()
                }
                _ => b"-ERR no such message\r\n".to_vec(),
            }
        };
        if write.write_all(&reply).await.is_err() || line.eq_ignore_ascii_case("QUIT") {
            return;
        }
    }
}

#[tokio::test]
async fn test_pop3_list_and_delete() {
    let maildrop = Arc::new(Mutex::new(Maildrop {
        messages: (1..=2).map(|n| Some(raw(n))).collect(),
        commands: Vec::new(),
    }));
    let served = Arc::clone(&maildrop);
    let port = listen(move |socket| serve_pop3(socket, Arc::clone(&served))).await;
    let registry = registry_for(&config("pop", port, Protocol::Pop3));
    let pool = registry.get_connection_pool("pop").unwrap();

    {
        let conn = pool.borrow().await.unwrap();
        let messages = list_messages(&conn, &MailboxQuery::default(), &MimeParser)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].subject, "message 2");
        assert!(messages[1].text_content.as_deref().unwrap().contains("Body of message 2"));

        assert!(delete_message(&conn, "INBOX", "<1@example.org>").await.unwrap());
    }

    let state = maildrop.lock().unwrap();
    assert_eq!(state.messages.len(), 1);
    assert!(state.commands.iter().any(|c| c == "DELE 1"));
    assert!(state.commands.iter().any(|c| c == "QUIT"));
}
