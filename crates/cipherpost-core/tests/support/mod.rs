//! Test doubles for the key store and transport, plus a mock SMTP relay
#![allow(dead_code)] // Not every test binary uses every helper

use async_trait::async_trait;
use cipherpost_common::{Error, KeyRef, Result};
use cipherpost_core::{KeyStore, Transport};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// In-memory key store producing fake armored ciphertext
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: HashMap<String, KeyRef>,
    expire_at_encrypt: HashSet<String>,
    lookups: Mutex<Vec<String>>,
    plaintexts: Mutex<Vec<Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, address: &str, id: &str) -> Self {
        self.keys.insert(address.to_string(), KeyRef::new(id));
        self
    }

    /// A key the store reports as expired at lookup time
    pub fn with_expired_key(mut self, address: &str, id: &str) -> Self {
        self.keys.insert(address.to_string(), KeyRef::expired(id));
        self
    }

    /// A key that looks valid but is refused when encrypting
    pub fn with_key_expiring_at_encrypt(mut self, address: &str, id: &str) -> Self {
        self.keys.insert(address.to_string(), KeyRef::new(id));
        self.expire_at_encrypt.insert(id.to_string());
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }

    pub fn plaintexts(&self) -> Vec<Vec<u8>> {
        self.plaintexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn lookup(&self, address: &str) -> Result<Option<KeyRef>> {
        self.lookups.lock().unwrap().push(address.to_string());
        Ok(self.keys.get(address).cloned())
    }

    async fn encrypt(&self, plaintext: &[u8], keys: &[KeyRef]) -> Result<Vec<u8>> {
        for key in keys {
            if key.expired || self.expire_at_encrypt.contains(&key.id) {
                return Err(Error::KeyExpired(key.id.clone()));
            }
        }

        self.plaintexts.lock().unwrap().push(plaintext.to_vec());
        let ids = keys.iter().map(|k| k.id.as_str()).collect::<Vec<_>>().join(",");
        Ok(format!(
            "-----BEGIN PGP MESSAGE-----\n\nfor {} ({} bytes)\n-----END PGP MESSAGE-----\n",
            ids,
            plaintext.len()
        )
        .into_bytes())
    }
}

/// A message handed to [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Vec<u8>,
    pub from: Option<String>,
    pub to: Vec<String>,
}

/// Transport that records deliveries and can refuse chosen recipients
#[derive(Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    refuse: HashSet<String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing(mut self, recipient: &str) -> Self {
        self.refuse.insert(recipient.to_string());
        self
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, message: &[u8], from: Option<&str>, to: &[String]) -> Result<()> {
        if let Some(refused) = to.iter().find(|r| self.refuse.contains(*r)) {
            return Err(Error::Delivery(format!("550 {} unknown", refused)));
        }

        self.deliveries.lock().unwrap().push(Delivery {
            message: message.to_vec(),
            from: from.map(String::from),
            to: to.to_vec(),
        });
        Ok(())
    }
}

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

/// Minimal SMTP server accepting every connection on a local port
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    handle: JoinHandle<()>,
}

impl MockSmtpServer {
    pub async fn start() -> Self {
        Self::with_rcpt_response(250, "OK").await
    }

    /// Start a server answering `RCPT TO` with the given reply
    pub async fn with_rcpt_response(code: u16, message: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let rcpt_reply = format!("{} {}\r\n", code, message);

        let handle = {
            let commands = commands.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let commands = commands.clone();
                    let rcpt_reply = rcpt_reply.clone();
                    tokio::spawn(async move {
                        let _ = handle_client(stream, commands, rcpt_reply).await;
                    });
                }
            })
        };

        Self {
            addr,
            commands,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Message bodies received after `DATA`
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.commands()
            .into_iter()
            .filter_map(|cmd| match cmd {
                SmtpCommand::MessageContent(data) => Some(data),
                _ => None,
            })
            .collect()
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_client(
    stream: TcpStream,
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    rcpt_reply: String,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    writer.write_all(b"220 Mock SMTP Server\r\n").await?;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        let upper = text.to_ascii_uppercase();

        let (command, reply): (SmtpCommand, &[u8]) = if upper.starts_with("EHLO") {
            (
                SmtpCommand::Ehlo(text[4..].trim().to_string()),
                &b"250-localhost\r\n250 SIZE 10000000\r\n"[..],
            )
        } else if upper.starts_with("MAIL FROM:") {
            (SmtpCommand::MailFrom(text[10..].trim().to_string()), &b"250 OK\r\n"[..])
        } else if upper.starts_with("RCPT TO:") {
            (SmtpCommand::RcptTo(text[8..].trim().to_string()), rcpt_reply.as_bytes())
        } else if upper == "DATA" {
            commands.lock().unwrap().push(SmtpCommand::Data);
            writer
                .write_all(&b"354 Start mail input; end with <CRLF>.<CRLF>\r\n"[..])
                .await?;
            let content = read_data(&mut reader).await?;
            (SmtpCommand::MessageContent(content), &b"250 OK: Message accepted\r\n"[..])
        } else if upper == "QUIT" {
            commands.lock().unwrap().push(SmtpCommand::Quit);
            writer.write_all(b"221 Bye\r\n").await?;
            return Ok(());
        } else if upper == "RSET" || upper == "NOOP" {
            (SmtpCommand::Other(text.clone()), &b"250 OK\r\n"[..])
        } else {
            (SmtpCommand::Other(text.clone()), &b"502 Command not implemented\r\n"[..])
        };

        commands.lock().unwrap().push(command);
        writer.write_all(reply).await?;
    }
}

/// Read a DATA payload up to the terminating dot line, undoing dot stuffing
async fn read_data<R>(reader: &mut BufReader<R>) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut content = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(content);
        }
        if line == b".\r\n" || line == b".\n" {
            return Ok(content);
        }

        let data = match line.strip_prefix(b".") {
            Some(rest) => rest,
            None => &line[..],
        };
        content.extend_from_slice(data);
    }
}
