// IRC transport: just enough of RFC 1459 for rendezvous
//
// Registration (NICK/USER), PING/PONG keepalive, JOIN, PRIVMSG and QUIT over
// plain TCP or TLS. Everything else the server sends is ignored.

use super::{ChatConnector, ChatError, ChatLink, ChatMessage, ChatSession};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Default TLS port used by most networks
pub const DEFAULT_IRC_PORT: u16 = 6697;

/// Longest line we will accept from the server
const MAX_LINE_LENGTH: usize = 8192;

const NICK_FIRST_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const NICK_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_[]\\`^{}";
const NICK_LENGTH: usize = 12;

/// IRC connection settings
#[derive(Debug, Clone)]
pub struct IrcConfig {
    pub server: String,
    pub port: u16,
    pub tls: bool,
    pub channel: String,
    pub username: String,
    pub realname: String,
    /// Bound on TCP connect, TLS handshake, registration and join together
    pub connect_timeout: Duration,
}

impl IrcConfig {
    pub fn new(server: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: DEFAULT_IRC_PORT,
            tls: true,
            channel: channel.into(),
            username: "AshDHT".to_string(),
            realname: "Ash DHT Bootstrap".to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_identity(mut self, username: impl Into<String>, realname: impl Into<String>) -> Self {
        self.username = username.into();
        self.realname = realname.into();
        self
    }
}

/// A random nick: one letter followed by letters, digits and IRC specials
pub fn generate_nick<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut nick = String::with_capacity(NICK_LENGTH);
    nick.push(*NICK_FIRST_CHARS.choose(rng).unwrap_or(&b'a') as char);
    for _ in 1..NICK_LENGTH {
        nick.push(*NICK_CHARS.choose(rng).unwrap_or(&b'a') as char);
    }
    nick
}

// ============================================================================
// LINE PARSING
// ============================================================================

/// One protocol line: `[:prefix] COMMAND params... [:trailing]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        // IRCv3 message tags
        if rest.starts_with('@') {
            rest = rest.split_once(' ')?.1;
        }
        rest = rest.trim_start();

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, tail) = stripped.split_once(' ')?;
            rest = tail.trim_start();
            Some(prefix.to_string())
        } else {
            None
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_string());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nick part of a `nick!user@host` prefix
    pub fn sender_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split(['!', '@']).next().unwrap_or(prefix))
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Convert a PRIVMSG into a chat message
    pub fn to_chat_message(&self) -> Option<ChatMessage> {
        if self.command != "PRIVMSG" {
            return None;
        }
        Some(ChatMessage::new(
            self.sender_nick()?,
            self.param(0)?,
            self.param(1).unwrap_or_default(),
        ))
    }
}

/// Strip CR/LF so user text cannot smuggle extra protocol lines
fn sanitize(text: &str) -> String {
    text.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

// ============================================================================
// CONNECTION
// ============================================================================

trait IrcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IrcStream for T {}

type IrcReader = BufReader<ReadHalf<Box<dyn IrcStream>>>;
type IrcWriter = Arc<Mutex<WriteHalf<Box<dyn IrcStream>>>>;

async fn send_line(writer: &IrcWriter, line: &str) -> Result<(), ChatError> {
    debug!("IRC >> {}", line);
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line, lossily decoded. `None` at end of stream.
///
/// At most `MAX_LINE_LENGTH` bytes are kept; the rest of a longer line is
/// read and dropped.
async fn read_line(reader: &mut IrcReader, buf: &mut Vec<u8>) -> Result<Option<String>, ChatError> {
    buf.clear();
    let n = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        skip_rest_of_line(reader).await?;
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn skip_rest_of_line(reader: &mut IrcReader) -> Result<(), ChatError> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Connects to an IRC server and joins the configured channel
#[derive(Debug, Clone)]
pub struct IrcConnector {
    config: IrcConfig,
}

impl IrcConnector {
    pub fn new(config: IrcConfig) -> Self {
        Self { config }
    }

    async fn open_stream(&self) -> Result<Box<dyn IrcStream>, ChatError> {
        let tcp = TcpStream::connect((self.config.server.as_str(), self.config.port))
            .await
            .map_err(|e| ChatError::ConnectionFailed(e.to_string()))?;

        if !self.config.tls {
            return Ok(Box::new(tcp));
        }

        let connector = tokio_native_tls::native_tls::TlsConnector::new()
            .map_err(|e| ChatError::Tls(e.to_string()))?;
        let stream = tokio_native_tls::TlsConnector::from(connector)
            .connect(&self.config.server, tcp)
            .await
            .map_err(|e| ChatError::Tls(e.to_string()))?;
        Ok(Box::new(stream))
    }

    /// NICK/USER until the welcome numeric; returns the nick the server accepted
    async fn register(
        &self,
        reader: &mut IrcReader,
        writer: &IrcWriter,
    ) -> Result<String, ChatError> {
        let mut nick = generate_nick(&mut rand::thread_rng());
        send_line(writer, &format!("NICK {}", nick)).await?;
        send_line(
            writer,
            &format!("USER {} 0 * :{}", self.config.username, sanitize(&self.config.realname)),
        )
        .await?;

        let mut buf = Vec::new();
        while let Some(raw) = read_line(reader, &mut buf).await? {
            let Some(line) = IrcLine::parse(&raw) else {
                continue;
            };
            match line.command.as_str() {
                "PING" => {
                    send_line(writer, &format!("PONG :{}", line.param(0).unwrap_or_default())).await?;
                }
                "001" => {
                    if let Some(accepted) = line.param(0) {
                        nick = accepted.to_string();
                    }
                    return Ok(nick);
                }
                // Nick in use or erroneous: pick another one
                "432" | "433" | "436" => {
                    nick = generate_nick(&mut rand::thread_rng());
                    debug!("Nick rejected ({}), retrying as {}", line.command, nick);
                    send_line(writer, &format!("NICK {}", nick)).await?;
                }
                "ERROR" => {
                    return Err(ChatError::Registration(
                        line.param(0).unwrap_or("server error").to_string(),
                    ));
                }
                _ => {}
            }
        }
        Err(ChatError::Closed)
    }

    async fn join(&self, nick: &str, reader: &mut IrcReader, writer: &IrcWriter) -> Result<(), ChatError> {
        let channel = &self.config.channel;
        send_line(writer, &format!("JOIN {}", channel)).await?;

        let mut buf = Vec::new();
        while let Some(raw) = read_line(reader, &mut buf).await? {
            let Some(line) = IrcLine::parse(&raw) else {
                continue;
            };
            match line.command.as_str() {
                "PING" => {
                    send_line(writer, &format!("PONG :{}", line.param(0).unwrap_or_default())).await?;
                }
                "JOIN" if line.sender_nick() == Some(nick)
                    && line.param(0).is_some_and(|c| c.eq_ignore_ascii_case(channel)) =>
                {
                    return Ok(());
                }
                "403" | "405" | "471" | "473" | "474" | "475" | "477" => {
                    return Err(ChatError::JoinFailed {
                        channel: channel.clone(),
                        reason: line.params.last().cloned().unwrap_or_default(),
                    });
                }
                "ERROR" => return Err(ChatError::Closed),
                _ => {}
            }
        }
        Err(ChatError::Closed)
    }

    async fn establish(&self) -> Result<ChatSession, ChatError> {
        let stream = self.open_stream().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: IrcReader = BufReader::new(read_half);
        let writer: IrcWriter = Arc::new(Mutex::new(write_half));

        let nick = self.register(&mut reader, &writer).await?;
        info!("Connected to {} as {}", self.config.server, nick);
        self.join(&nick, &mut reader, &writer).await?;
        info!("Joined channel {}", self.config.channel);

        let (tx, rx) = mpsc::channel(64);
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&writer), tx));

        let link = IrcLink {
            writer,
            reader: reader_task.abort_handle(),
        };
        Ok(ChatSession::new(
            nick,
            self.config.channel.clone(),
            Arc::new(link),
            rx,
        ))
    }
}

#[async_trait]
impl ChatConnector for IrcConnector {
    async fn connect(&self) -> Result<ChatSession, ChatError> {
        tokio::time::timeout(self.config.connect_timeout, self.establish())
            .await
            .map_err(|_| ChatError::ConnectTimeout)?
    }
}

/// Forward PRIVMSGs to the session and answer keepalives until the server
/// closes the connection or the session is dropped.
async fn read_loop(mut reader: IrcReader, writer: IrcWriter, tx: mpsc::Sender<ChatMessage>) {
    let mut buf = Vec::new();
    loop {
        let raw = match read_line(&mut reader, &mut buf).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("IRC server closed the connection");
                break;
            }
            Err(e) => {
                warn!("IRC read failed: {}", e);
                break;
            }
        };
        let Some(line) = IrcLine::parse(&raw) else {
            continue;
        };
        debug!("IRC << {}", raw.trim_end());

        match line.command.as_str() {
            "PING" => {
                let pong = format!("PONG :{}", line.param(0).unwrap_or_default());
                if let Err(e) = send_line(&writer, &pong).await {
                    warn!("Failed to answer PING: {}", e);
                    break;
                }
            }
            "PRIVMSG" => {
                if let Some(message) = line.to_chat_message() {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
            }
            "ERROR" => {
                warn!("IRC server error: {}", line.param(0).unwrap_or_default());
                break;
            }
            _ => {}
        }
    }
}

struct IrcLink {
    writer: IrcWriter,
    reader: AbortHandle,
}

#[async_trait]
impl ChatLink for IrcLink {
    async fn send_text(&self, target: &str, text: &str) -> Result<(), ChatError> {
        send_line(&self.writer, &format!("PRIVMSG {} :{}", target, sanitize(text))).await
    }

    async fn quit(&self, reason: &str) -> Result<(), ChatError> {
        let result = send_line(&self.writer, &format!("QUIT :{}", sanitize(reason))).await;
        self.reader.abort();
        let _ = self.writer.lock().await.shutdown().await;
        result
    }
}

impl Drop for IrcLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_oversized_line_is_bounded() {
        let (client, mut server) = tokio::io::duplex(1024);
        let stream: Box<dyn IrcStream> = Box::new(client);
        let (read_half, _write_half) = tokio::io::split(stream);
        let mut reader: IrcReader = BufReader::new(read_half);

        tokio::spawn(async move {
            let flood = vec![b'A'; MAX_LINE_LENGTH * 4];
            server.write_all(&flood).await.unwrap();
            server.write_all(b"\r\nPING :after\r\n").await.unwrap();
        });

        let mut buf = Vec::new();
        let first = read_line(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE_LENGTH);

        let second = read_line(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(second, "PING :after\r\n");
    }

    #[test]
    fn test_parse_privmsg() {
        let line = IrcLine::parse(":Kx91!~ash@host.example PRIVMSG #soulfire :!bootstrap\r\n").unwrap();
        assert_eq!(line.prefix.as_deref(), Some("Kx91!~ash@host.example"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#soulfire", "!bootstrap"]);
        assert_eq!(line.sender_nick(), Some("Kx91"));

        let msg = line.to_chat_message().unwrap();
        assert_eq!(msg, ChatMessage::new("Kx91", "#soulfire", "!bootstrap"));
    }

    #[test]
    fn test_parse_trailing_with_spaces() {
        let line = IrcLine::parse(":bot PRIVMSG me :!bootstrap 1.2.3.4:5 6.7.8.9:10").unwrap();
        assert_eq!(line.param(1), Some("!bootstrap 1.2.3.4:5 6.7.8.9:10"));
    }

    #[test]
    fn test_parse_ping_without_prefix() {
        let line = IrcLine::parse("PING :irc.libera.chat").unwrap();
        assert!(line.prefix.is_none());
        assert_eq!(line.command, "PING");
        assert_eq!(line.param(0), Some("irc.libera.chat"));
    }

    #[test]
    fn test_parse_numeric_and_tags() {
        let line = IrcLine::parse("@time=2024-01-01T00:00:00Z :server 001 Kx91 :Welcome").unwrap();
        assert_eq!(line.command, "001");
        assert_eq!(line.params, vec!["Kx91", "Welcome"]);

        assert!(IrcLine::parse("").is_none());
        assert!(IrcLine::parse(":prefixonly").is_none());
    }

    #[test]
    fn test_generated_nick_alphabet() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let nick = generate_nick(&mut rng);
            assert_eq!(nick.len(), NICK_LENGTH);
            assert!(nick.chars().next().unwrap().is_ascii_alphabetic());
            assert!(nick.bytes().all(|b| NICK_CHARS.contains(&b)));
        }
    }

    #[test]
    fn test_sanitize_strips_line_breaks() {
        assert_eq!(sanitize("a\r\nQUIT :x"), "aQUIT :x");
    }

    /// Minimal scripted server: welcome, confirm the join, deliver one
    /// PRIVMSG, then record what the client sends.
    #[tokio::test]
    async fn test_connect_join_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut lines = BufReader::new(read_half).lines();

            let mut nick = String::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                if let Some(n) = line.strip_prefix("NICK ") {
                    nick = n.to_string();
                }
                if line.starts_with("USER ") {
                    break;
                }
            }
            write_half
                .write_all(format!(":srv 001 {} :Welcome\r\nPING :srv\r\n", nick).as_bytes())
                .await
                .unwrap();

            let mut seen = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                seen.push(line.clone());
                if line.starts_with("JOIN ") {
                    write_half
                        .write_all(
                            format!(
                                ":{nick}!u@h JOIN #soulfire\r\n:peer!u@h PRIVMSG {nick} :!bootstrap 1.2.3.4:5\r\n"
                            )
                            .as_bytes(),
                        )
                        .await
                        .unwrap();
                }
                if line.starts_with("QUIT ") {
                    break;
                }
            }
            let mut rest = String::new();
            let _ = lines.into_inner().read_to_string(&mut rest).await;
            seen
        });

        let mut config = IrcConfig::new("127.0.0.1", "#soulfire");
        config.port = port;
        config.tls = false;
        let mut session = IrcConnector::new(config).connect().await.unwrap();

        let msg = session.next_message().await.unwrap();
        assert_eq!(msg.sender, "peer");
        assert_eq!(msg.target, session.nick());
        assert_eq!(msg.body, "!bootstrap 1.2.3.4:5");

        session.broadcast("!bootstrap").await.unwrap();
        session.quit("done").await.unwrap();

        let seen = server.await.unwrap();
        assert!(seen.iter().any(|l| l == "PONG :srv"));
        assert!(seen.iter().any(|l| l == "JOIN #soulfire"));
        assert!(seen.iter().any(|l| l == "PRIVMSG #soulfire :!bootstrap"));
        assert_eq!(seen.last().map(String::as_str), Some("QUIT :done"));
    }
}
