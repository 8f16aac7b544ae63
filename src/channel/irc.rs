use super::{ControlChannel, Outbound};
use crate::commands::Command;
use crate::config::Config;
use crate::engine::EngineEvent;
use crate::types::Link;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_rustls::TlsConnector;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const RPL_WELCOME: &str = "001";
const RPL_ENDOFSTATS: &str = "219";
const RPL_LINKS: &str = "364";
const RPL_ENDOFLINKS: &str = "365";

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub struct IrcChannel {
    config: Arc<Config>,
}

impl IrcChannel {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<Box<dyn Stream>> {
        let server = &self.config.server;
        let tcp = TcpStream::connect((server.host.as_str(), server.port)).await?;
        if !server.secure {
            return Ok(Box::new(tcp));
        }
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        let name = ServerName::try_from(server.host.clone())
            .map_err(|e| anyhow!("invalid server host {}: {}", server.host, e))?;
        let stream = TlsConnector::from(Arc::new(tls)).connect(name, tcp).await?;
        Ok(Box::new(stream))
    }

    /// Run one session until the connection drops.
    async fn session(
        &self,
        events: &mpsc::UnboundedSender<EngineEvent>,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<()> {
        let stream = self.connect().await.context("connect failed")?;
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).split(b'\n');
        let mut session = Session::new(&self.config);

        let user = &self.config.user;
        for line in [
            format!("NICK {}", user.nick),
            format!("USER {} 0 * :{}", user.ident, user.gecos),
        ] {
            write_line(&mut writer, &line).await?;
        }

        loop {
            tokio::select! {
                segment = lines.next_segment() => {
                    let Some(raw) = segment? else {
                        return Err(anyhow!("connection closed by server"));
                    };
                    // Servers relay whatever encoding clients send.
                    let line = String::from_utf8_lossy(&raw);
                    let (replies, event) = session.on_line(&line);
                    for reply in replies {
                        write_line(&mut writer, &reply).await?;
                    }
                    if let Some(event) = event {
                        if events.send(event).is_err() {
                            return Ok(());
                        }
                    }
                }
                message = outbound.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    write_line(&mut writer, &to_line(&message)).await?;
                }
            }
        }
    }
}

#[async_trait]
impl ControlChannel for IrcChannel {
    async fn run(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<()> {
        loop {
            info!(
                "Connecting to {}:{}",
                self.config.server.host, self.config.server.port
            );
            match self.session(&events, &mut outbound).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!("IRC session ended: {:#}. Reconnecting in 5s...", e);
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    debug!(">> {}", line);
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

fn to_line(message: &Outbound) -> String {
    match message {
        Outbound::Links => "LINKS".to_string(),
        Outbound::StatsP { server } => format!("STATS P {}", server),
        Outbound::Reply { target, text } => format!("PRIVMSG {} :{}", target, text),
    }
}

/// A parsed protocol line borrowing from the raw text.
#[derive(Debug, PartialEq, Eq)]
struct Message<'a> {
    prefix: Option<&'a str>,
    command: &'a str,
    params: Vec<&'a str>,
}

impl<'a> Message<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let mut rest = line.trim_end_matches(&['\r', '\n'][..]);
        if rest.starts_with('@') {
            rest = rest.split_once(' ')?.1.trim_start();
        }
        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, r) = stripped.split_once(' ')?;
            prefix = Some(p);
            rest = r.trim_start();
        }
        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut words = head.split_whitespace();
        let command = words.next()?;
        let mut params: Vec<&str> = words.collect();
        params.extend(trailing);
        Some(Self {
            prefix,
            command,
            params,
        })
    }

    /// Prefix of a server-originated message (no `nick!user@host`).
    fn server(&self) -> Option<&'a str> {
        self.prefix.filter(|p| !p.contains('!'))
    }
}

/// Protocol state for one connection.
struct Session<'c> {
    config: &'c Config,
    nick: String,
    links: Vec<Link>,
}

impl<'c> Session<'c> {
    fn new(config: &'c Config) -> Self {
        Self {
            config,
            nick: config.user.nick.clone(),
            links: Vec::new(),
        }
    }

    /// Handle one inbound line, returning raw replies and an engine event.
    fn on_line(&mut self, line: &str) -> (Vec<String>, Option<EngineEvent>) {
        let Some(msg) = Message::parse(line) else {
            warn!("Unparseable line: {}", line);
            return (Vec::new(), None);
        };
        match msg.command {
            "PING" => {
                let token = msg.params.first().copied().unwrap_or_default();
                (vec![format!("PONG :{}", token)], None)
            }
            RPL_WELCOME => {
                if let Some(nick) = msg.params.first() {
                    self.nick = nick.to_string();
                }
                info!("Registered as {}", self.nick);
                let mut replies = Vec::new();
                if let Some(oper) = &self.config.user.oper {
                    replies.push(format!("OPER {} {}", oper.name, oper.password));
                }
                replies.extend(self.config.channels.iter().map(|c| format!("JOIN {}", c)));
                (replies, Some(EngineEvent::SessionReady))
            }
            RPL_LINKS => {
                // <me> <mask> <server> :<hopcount> <info>
                if let [_, address, access_via, ..] = msg.params.as_slice() {
                    self.links.push(Link {
                        address: address.to_string(),
                        access_via: access_via.to_string(),
                    });
                }
                (Vec::new(), None)
            }
            RPL_ENDOFLINKS => {
                info!("Got link data");
                let links = std::mem::take(&mut self.links);
                (Vec::new(), Some(EngineEvent::Topology(links)))
            }
            RPL_ENDOFSTATS if msg.params.get(1) == Some(&"P") => {
                let event = msg.server().map(|server| EngineEvent::CapabilityEnd {
                    server: server.to_string(),
                });
                (Vec::new(), event)
            }
            "NOTICE" => {
                let event = match (msg.server(), msg.params.as_slice()) {
                    (Some(server), [target, text]) if *target == self.nick => {
                        Some(EngineEvent::CapabilityLine {
                            server: server.to_string(),
                            line: text.to_string(),
                        })
                    }
                    _ => None,
                };
                (Vec::new(), event)
            }
            "PRIVMSG" => {
                let event = match msg.params.as_slice() {
                    [target, text] if self.config.channels.iter().any(|c| c == *target) => {
                        Command::parse(text, &self.config.prefix).map(|command| {
                            EngineEvent::Command {
                                reply_to: target.to_string(),
                                command,
                            }
                        })
                    }
                    _ => None,
                };
                (Vec::new(), event)
            }
            _ => (Vec::new(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.user.nick = "CertServ".into();
        config.channels = vec!["#ops".into()];
        config
    }

    #[test]
    fn parses_prefix_params_and_trailing() {
        let msg = Message::parse(":irc.a.example 364 CertServ b.example a.example :1 Some server\r\n")
            .unwrap();
        assert_eq!(msg.prefix, Some("irc.a.example"));
        assert_eq!(msg.command, "364");
        assert_eq!(
            msg.params,
            vec!["CertServ", "b.example", "a.example", "1 Some server"]
        );
        assert_eq!(msg.server(), Some("irc.a.example"));

        let msg = Message::parse("@time=2024 :nick!u@h PRIVMSG #ops :!help").unwrap();
        assert_eq!(msg.server(), None);
        assert_eq!(msg.params, vec!["#ops", "!help"]);
    }

    #[test]
    fn welcome_opers_joins_and_reports_ready() {
        let mut config = config();
        config.user.oper = Some(crate::config::OperConfig {
            name: "certserv".into(),
            password: "hunter2".into(),
        });
        let mut session = Session::new(&config);
        let (replies, event) = session.on_line(":irc.example 001 CertServ :Welcome");
        assert_eq!(replies, vec!["OPER certserv hunter2", "JOIN #ops"]);
        assert!(matches!(event, Some(EngineEvent::SessionReady)));
    }

    #[test]
    fn links_are_collected_until_end() {
        let config = config();
        let mut session = Session::new(&config);
        let (_, event) = session.on_line(":a.example 364 CertServ a.example a.example :0 Hub");
        assert!(event.is_none());
        session.on_line(":a.example 364 CertServ b.example a.example :1 Leaf");
        let (_, event) = session.on_line(":a.example 365 CertServ * :End of /LINKS list.");
        match event {
            Some(EngineEvent::Topology(links)) => {
                assert_eq!(links.len(), 2);
                assert_eq!(links[1].address, "b.example");
                assert_eq!(links[1].access_via, "a.example");
            }
            other => panic!("expected topology, got {:?}", other),
        }
    }

    #[test]
    fn stats_notices_and_end_marker() {
        let config = config();
        let mut session = Session::new(&config);
        let (_, event) = session.on_line(
            ":b.example NOTICE CertServ :*** Listener on b.example:6697 (IPv4): has 3 client(s), options: tls",
        );
        match event {
            Some(EngineEvent::CapabilityLine { server, line }) => {
                assert_eq!(server, "b.example");
                assert!(line.starts_with("*** Listener on"));
            }
            other => panic!("expected capability line, got {:?}", other),
        }

        let (_, event) = session.on_line(":someone!u@h NOTICE CertServ :*** Listener on x:1 (IPv4)");
        assert!(event.is_none());

        let (_, event) = session.on_line(":b.example 219 CertServ P :End of /STATS report");
        assert!(matches!(
            event,
            Some(EngineEvent::CapabilityEnd { server }) if server == "b.example"
        ));
    }

    #[test]
    fn channel_commands_become_events() {
        let config = config();
        let mut session = Session::new(&config);
        let (_, event) = session.on_line(":op!o@h PRIVMSG #ops :!refresh a.example");
        assert!(matches!(
            event,
            Some(EngineEvent::Command { reply_to, command: Command::Refresh(Some(server)) })
                if reply_to == "#ops" && server == "a.example"
        ));

        let (_, event) = session.on_line(":op!o@h PRIVMSG #elsewhere :!help");
        assert!(event.is_none());
    }

    #[test]
    fn ping_is_answered() {
        let config = config();
        let mut session = Session::new(&config);
        let (replies, _) = session.on_line("PING :token");
        assert_eq!(replies, vec!["PONG :token"]);
    }

    #[tokio::test]
    async fn non_utf8_line_keeps_session_alive() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config();
        config.server.host = "127.0.0.1".into();
        config.server.port = listener.local_addr().unwrap().port();
        config.server.secure = false;

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = tokio::io::split(socket);
            writer
                .write_all(b":op!o@h PRIVMSG #ops :!check caf\xe9\r\nPING :still-here\r\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(reader).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                if line.starts_with("PONG") {
                    return line;
                }
            }
            String::new()
        });

        let channel = IrcChannel::new(Arc::new(config));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let result = channel.session(&events_tx, &mut outbound_rx).await;

        assert_eq!(server.await.unwrap(), "PONG :still-here");
        assert!(result.is_err());
        match events_rx.try_recv() {
            Ok(EngineEvent::Command {
                command: Command::Check(Some(server)),
                ..
            }) => assert_eq!(server, "caf\u{fffd}"),
            other => panic!("expected check command, got {:?}", other),
        }
    }

    #[test]
    fn outbound_lines() {
        assert_eq!(to_line(&Outbound::Links), "LINKS");
        assert_eq!(
            to_line(&Outbound::StatsP {
                server: "a.example".into()
            }),
            "STATS P a.example"
        );
        assert_eq!(to_line(&Outbound::reply("#ops", "Done!")), "PRIVMSG #ops :Done!");
    }
}
