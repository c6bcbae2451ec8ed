//! Configuration file parsing
//!
//! Line-oriented syntax: `#` starts a comment, values may be single- or
//! double-quoted, and an option is written `name value` or `name = value`.
//! Blocks open with `Kind name {` and close with a lone `}`:
//!
//! ```text
//! ListenUDP *:1812
//! LogLevel 3
//!
//! TLS default {
//!     CACertificateFile /etc/cacert.pem
//!     CertificateFile /etc/host.pem
//!     CertificateKeyFile /etc/host.key
//! }
//!
//! Client radius.example.com {
//!     type udp
//!     secret testing123
//! }
//! ```
//!
//! Option names are matched case-insensitively. TLS blocks must appear
//! before the Client/Server blocks that reference them, and Server blocks
//! before the Realm blocks that name them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

pub const DEFAULT_UDP_PORT: u16 = 1812;
pub const DEFAULT_TLS_PORT: u16 = 2083;
/// Placeholder secret for TLS peers with no explicit one; the TLS channel
/// is the actual protection there.
pub const DEFAULT_TLS_SECRET: &str = "mysecret";
/// Reply-Message must fit a single attribute value.
pub const MAX_REPLY_MESSAGE: usize = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tls,
}

/// A `ListenUDP`/`ListenTCP` value: `*[:port]`, `IPv4[:port]` or
/// `[IPv6][:port]`. A missing or `*` host means the wildcard address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    File(PathBuf),
    Syslog(String),
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Block label; also the host name the peer resolves to and the name
    /// its certificate must carry.
    pub host: String,
    pub transport: Transport,
    pub secret: String,
    /// Destination port, servers only.
    pub port: Option<u16>,
    /// Resolved TLS context name for tls-type peers.
    pub tls: Option<String>,
    /// Status-Server keepalive probing, servers only.
    pub status_server: bool,
}

#[derive(Debug, Clone)]
pub struct RealmEntry {
    pub pattern: String,
    pub server: Option<String>,
    pub reply_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TlsEntry {
    pub name: String,
    pub ca_cert_file: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub key_password: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub listen_udp: Option<ListenAddr>,
    pub listen_tcp: Option<ListenAddr>,
    pub log_level: Option<u8>,
    pub log_destination: Option<LogDestination>,
    pub clients: Vec<PeerEntry>,
    pub servers: Vec<PeerEntry>,
    pub realms: Vec<RealmEntry>,
    pub tls: Vec<TlsEntry>,
}

impl Config {
    /// Read and parse a configuration file. If `path` cannot be opened,
    /// its base name is tried in the working directory.
    pub fn load(path: &Path) -> ConfigResult<Config> {
        let text = match fs::read_to_string(path) {
            Ok(text) => {
                debug!(path = %path.display(), "reading config file");
                text
            }
            Err(_) => {
                let base = path
                    .file_name()
                    .map(PathBuf::from)
                    .ok_or_else(|| ConfigError::ConfigFileNotFound(path.display().to_string()))?;
                fs::read_to_string(&base).map_err(|_| {
                    ConfigError::ConfigFileNotFound(path.display().to_string())
                })?
            }
        };
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> ConfigResult<Config> {
        Parser::new(text.lines()).run()
    }
}

/// Split one line into at most three tokens, honoring quotes. A `#` at the
/// start of the first token comments out the line.
fn tokenize(line: &str) -> ConfigResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while tokens.len() < 3 {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else { break };
        if tokens.is_empty() && first == '#' {
            break;
        }
        if first == '"' || first == '\'' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == first => break,
                    Some(c) => token.push(c),
                    None => return Err(ConfigError::Syntax(line.trim().to_string())),
                }
            }
            if matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                return Err(ConfigError::Syntax(line.trim().to_string()));
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                token.push(chars.next().unwrap());
            }
            tokens.push(token);
        }
    }
    Ok(tokens)
}

/// One parsed line of interest.
enum Line {
    /// `option value` or `option = value`
    Option(String, String),
    /// `kind name {`
    BlockStart(String, String),
    /// `}`
    BlockEnd,
}

struct Parser<'a> {
    lines: std::str::Lines<'a>,
    config: Config,
}

impl<'a> Parser<'a> {
    fn new(lines: std::str::Lines<'a>) -> Self {
        Parser {
            lines,
            config: Config::default(),
        }
    }

    fn next_line(&mut self) -> ConfigResult<Option<Line>> {
        for raw in self.lines.by_ref() {
            let tokens = tokenize(raw)?;
            if tokens.is_empty() {
                continue;
            }
            if tokens[0].starts_with('}') {
                return Ok(Some(Line::BlockEnd));
            }
            let line = match tokens.len() {
                2 => Line::Option(tokens[0].clone(), tokens[1].clone()),
                3 if tokens[1] == "=" => Line::Option(tokens[0].clone(), tokens[2].clone()),
                3 if tokens[2] == "{" => Line::BlockStart(tokens[0].clone(), tokens[1].clone()),
                _ => return Err(ConfigError::Syntax(raw.trim().to_string())),
            };
            if let Line::Option(opt, val) = &line
                && val.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "option {opt} needs a non-empty value"
                )));
            }
            return Ok(Some(line));
        }
        Ok(None)
    }

    fn run(mut self) -> ConfigResult<Config> {
        while let Some(line) = self.next_line()? {
            match line {
                Line::Option(opt, val) => self.top_level_option(&opt, &val)?,
                Line::BlockStart(kind, name) => self.block(&kind, &name)?,
                Line::BlockEnd => {
                    return Err(ConfigError::Invalid(
                        "found } with no matching {".to_string(),
                    ));
                }
            }
        }
        Ok(self.config)
    }

    fn top_level_option(&mut self, opt: &str, val: &str) -> ConfigResult<()> {
        debug!(option = opt, value = val, "config option");
        match opt.to_ascii_lowercase().as_str() {
            "listenudp" => self.config.listen_udp = Some(parse_listen(val, DEFAULT_UDP_PORT)?),
            "listentcp" => self.config.listen_tcp = Some(parse_listen(val, DEFAULT_TLS_PORT)?),
            "loglevel" => {
                let level: u8 = val
                    .parse()
                    .ok()
                    .filter(|l| (1..=4).contains(l))
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "value of option LogLevel is {val}, must be 1, 2, 3 or 4"
                        ))
                    })?;
                self.config.log_level = Some(level);
            }
            "logdestination" => {
                self.config.log_destination = Some(parse_log_destination(val)?);
            }
            _ => return Err(ConfigError::Invalid(format!("unknown option {opt}"))),
        }
        Ok(())
    }

    /// Collect the body of a block into an option map, failing on options
    /// outside `allowed`.
    fn block_body(&mut self, block: &str, allowed: &[&str]) -> ConfigResult<HashMap<String, String>> {
        let mut options = HashMap::new();
        loop {
            match self.next_line()? {
                Some(Line::Option(opt, val)) => {
                    let key = opt.to_ascii_lowercase();
                    if !allowed.contains(&key.as_str()) {
                        return Err(ConfigError::Block {
                            block: block.to_string(),
                            message: format!("unknown option {opt}"),
                        });
                    }
                    debug!(block, option = %opt, value = %val, "block option");
                    options.insert(key, val);
                }
                Some(Line::BlockEnd) => return Ok(options),
                Some(Line::BlockStart(kind, _)) => {
                    return Err(ConfigError::Block {
                        block: block.to_string(),
                        message: format!("unexpected block {kind}"),
                    });
                }
                None => {
                    return Err(ConfigError::Block {
                        block: block.to_string(),
                        message: "unterminated block".to_string(),
                    });
                }
            }
        }
    }

    fn block(&mut self, kind: &str, name: &str) -> ConfigResult<()> {
        let block = format!("{kind} {name}");
        match kind.to_ascii_lowercase().as_str() {
            "client" => {
                let opts = self.block_body(&block, &["type", "secret", "tls"])?;
                let peer = self.peer_entry(&block, name, &opts, false)?;
                self.config.clients.push(peer);
            }
            "server" => {
                let opts =
                    self.block_body(&block, &["type", "secret", "port", "tls", "statusserver"])?;
                let peer = self.peer_entry(&block, name, &opts, true)?;
                self.config.servers.push(peer);
            }
            "realm" => {
                let opts = self.block_body(&block, &["server", "replymessage"])?;
                let server = opts.get("server").cloned();
                if let Some(server) = &server
                    && !self
                        .config
                        .servers
                        .iter()
                        .any(|s| s.host.eq_ignore_ascii_case(server))
                {
                    return Err(ConfigError::Block {
                        block,
                        message: format!("no server {server}"),
                    });
                }
                let reply_message = opts.get("replymessage").cloned();
                if let Some(message) = &reply_message
                    && message.len() > MAX_REPLY_MESSAGE
                {
                    return Err(ConfigError::Block {
                        block,
                        message: format!("ReplyMessage can be at most {MAX_REPLY_MESSAGE} bytes"),
                    });
                }
                self.config.realms.push(RealmEntry {
                    pattern: name.to_string(),
                    server,
                    reply_message,
                });
            }
            "tls" => {
                let opts = self.block_body(
                    &block,
                    &[
                        "cacertificatefile",
                        "cacertificatepath",
                        "certificatefile",
                        "certificatekeyfile",
                        "certificatekeypassword",
                    ],
                )?;
                let ca_cert_file = opts.get("cacertificatefile").map(PathBuf::from);
                let ca_cert_path = opts.get("cacertificatepath").map(PathBuf::from);
                if ca_cert_file.is_none() && ca_cert_path.is_none() {
                    return Err(ConfigError::Block {
                        block,
                        message: "CA certificate file or path needs to be specified".to_string(),
                    });
                }
                let require = |key: &str, label: &str| -> ConfigResult<PathBuf> {
                    opts.get(key).map(PathBuf::from).ok_or_else(|| {
                        ConfigError::Block {
                            block: block.clone(),
                            message: format!("{label} must be specified"),
                        }
                    })
                };
                self.config.tls.push(TlsEntry {
                    name: name.to_string(),
                    ca_cert_file,
                    ca_cert_path,
                    cert_file: require("certificatefile", "CertificateFile")?,
                    key_file: require("certificatekeyfile", "CertificateKeyFile")?,
                    key_password: opts.get("certificatekeypassword").cloned(),
                });
            }
            _ => {
                return Err(ConfigError::Invalid(format!("unknown block type {kind}")));
            }
        }
        Ok(())
    }

    fn peer_entry(
        &self,
        block: &str,
        host: &str,
        opts: &HashMap<String, String>,
        is_server: bool,
    ) -> ConfigResult<PeerEntry> {
        let block_err = |message: String| ConfigError::Block {
            block: block.to_string(),
            message,
        };

        let transport = match opts.get("type").map(|t| t.to_ascii_lowercase()).as_deref() {
            Some("udp") => Transport::Udp,
            Some("tls") => Transport::Tls,
            _ => return Err(block_err("type must be set to UDP or TLS".to_string())),
        };

        let tls = if transport == Transport::Tls {
            let fallbacks: (&str, Option<&str>) = match opts.get("tls") {
                Some(name) => (name.as_str(), None),
                None if is_server => ("defaultserver", Some("default")),
                None => ("defaultclient", Some("default")),
            };
            Some(
                self.resolve_tls(fallbacks.0, fallbacks.1)
                    .ok_or_else(|| ConfigError::NoTlsContext(block.to_string()))?,
            )
        } else {
            None
        };

        let secret = match opts.get("secret") {
            Some(secret) => secret.clone(),
            None if transport == Transport::Udp => {
                return Err(block_err("secret must be specified for UDP".to_string()));
            }
            None => DEFAULT_TLS_SECRET.to_string(),
        };

        let port = match opts.get("port") {
            Some(port) if is_server => Some(port.parse().map_err(|_| {
                block_err(format!("invalid port {port}"))
            })?),
            _ => None,
        };

        let status_server = match opts.get("statusserver").map(|s| s.to_ascii_lowercase()) {
            Some(ref s) if s == "on" => true,
            Some(ref s) if s == "off" => false,
            None => false,
            Some(s) => {
                return Err(block_err(format!(
                    "StatusServer is {s}, must be on or off"
                )));
            }
        };

        Ok(PeerEntry {
            host: host.to_string(),
            transport,
            secret,
            port,
            tls,
            status_server,
        })
    }

    /// Look up a TLS context among the blocks seen so far, by exact name
    /// first and the fallback name second (both case-insensitive).
    fn resolve_tls(&self, name: &str, fallback: Option<&str>) -> Option<String> {
        let find = |n: &str| {
            self.config
                .tls
                .iter()
                .find(|t| t.name.eq_ignore_ascii_case(n))
                .map(|t| t.name.clone())
        };
        find(name).or_else(|| fallback.and_then(find))
    }
}

fn parse_listen(value: &str, default_port: u16) -> ConfigResult<ListenAddr> {
    let bad = || ConfigError::Invalid(format!("invalid listener address {value}"));

    let (host, rest) = if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        (Some(rest[..end].to_string()), &rest[end + 1..])
    } else {
        match value.find(':') {
            Some(colon) => (Some(value[..colon].to_string()), &value[colon..]),
            None => (Some(value.to_string()), ""),
        }
    };

    let host = host.filter(|h| !h.is_empty()).ok_or_else(bad)?;
    let host = if host == "*" { None } else { Some(host) };

    let port = match rest.strip_prefix(':') {
        Some(port) => port.parse().map_err(|_| bad())?,
        None if rest.is_empty() => default_port,
        None => return Err(bad()),
    };

    Ok(ListenAddr { host, port })
}

fn parse_log_destination(value: &str) -> ConfigResult<LogDestination> {
    if let Some(path) = value.strip_prefix("file://") {
        if path.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "invalid log destination {value}"
            )));
        }
        return Ok(LogDestination::File(PathBuf::from(path)));
    }
    if let Some(facility) = value.strip_prefix("x-syslog:///") {
        return Ok(LogDestination::Syslog(facility.to_string()));
    }
    Err(ConfigError::Invalid(format!(
        "invalid log destination {value}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# sample proxy configuration
ListenUDP *:1812
LogLevel 3
LogDestination file:///var/log/radsecproxy.log

TLS default {
    CACertificateFile /etc/cacert.pem
    CertificateFile /etc/host.pem
    CertificateKeyFile /etc/host.key
}

Client nas1.example.com {
    type udp
    secret testing123
}

Client peer.example.net {
    type tls
}

Server radius.example.org {
    type udp
    secret "up secret"
    port 11812
    StatusServer on
}

Realm example.org {
    server radius.example.org
}

Realm * {
    ReplyMessage "Blocked"
}
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(
            config.listen_udp,
            Some(ListenAddr {
                host: None,
                port: 1812
            })
        );
        assert_eq!(config.log_level, Some(3));
        assert_eq!(
            config.log_destination,
            Some(LogDestination::File(PathBuf::from(
                "/var/log/radsecproxy.log"
            )))
        );

        assert_eq!(config.clients.len(), 2);
        assert_eq!(config.clients[0].host, "nas1.example.com");
        assert_eq!(config.clients[0].transport, Transport::Udp);
        assert_eq!(config.clients[0].secret, "testing123");
        assert_eq!(config.clients[1].transport, Transport::Tls);
        assert_eq!(config.clients[1].secret, DEFAULT_TLS_SECRET);
        assert_eq!(config.clients[1].tls.as_deref(), Some("default"));

        assert_eq!(config.servers.len(), 1);
        let server = &config.servers[0];
        assert_eq!(server.secret, "up secret");
        assert_eq!(server.port, Some(11812));
        assert!(server.status_server);

        assert_eq!(config.realms.len(), 2);
        assert_eq!(config.realms[0].server.as_deref(), Some("radius.example.org"));
        assert_eq!(config.realms[1].server, None);
        assert_eq!(config.realms[1].reply_message.as_deref(), Some("Blocked"));
    }

    #[test]
    fn test_equals_syntax_and_quotes() {
        let config = Config::parse("LogLevel = 2\nListenUDP '10.0.0.1:2000'\n").unwrap();
        assert_eq!(config.log_level, Some(2));
        assert_eq!(
            config.listen_udp,
            Some(ListenAddr {
                host: Some("10.0.0.1".to_string()),
                port: 2000
            })
        );
    }

    #[test]
    fn test_udp_client_requires_secret() {
        let err = Config::parse("Client c {\n type udp\n}\n").unwrap_err();
        assert!(err.to_string().contains("secret"));
    }

    #[test]
    fn test_type_required() {
        assert!(Config::parse("Client c {\n secret x\n}\n").is_err());
    }

    #[test]
    fn test_tls_client_needs_context() {
        let err = Config::parse("Client c {\n type tls\n}\n").unwrap_err();
        assert!(matches!(err, ConfigError::NoTlsContext(_)));
    }

    #[test]
    fn test_tls_context_must_precede_referent() {
        let text = r#"
Client c {
    type tls
}
TLS default {
    CACertificateFile ca.pem
    CertificateFile cert.pem
    CertificateKeyFile key.pem
}
"#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn test_explicit_tls_name_has_no_fallback() {
        let text = r#"
TLS default {
    CACertificateFile ca.pem
    CertificateFile cert.pem
    CertificateKeyFile key.pem
}
Client c {
    type tls
    tls other
}
"#;
        assert!(matches!(
            Config::parse(text).unwrap_err(),
            ConfigError::NoTlsContext(_)
        ));
    }

    #[test]
    fn test_realm_unknown_server() {
        let err = Config::parse("Realm r {\n server missing\n}\n").unwrap_err();
        assert!(err.to_string().contains("no server"));
    }

    #[test]
    fn test_reply_message_too_long() {
        let text = format!("Realm r {{\n ReplyMessage \"{}\"\n}}\n", "x".repeat(254));
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn test_unknown_option_fatal() {
        assert!(Config::parse("Frobnicate yes\n").is_err());
        assert!(Config::parse("Client c {\n bogus 1\n}\n").is_err());
    }

    #[test]
    fn test_status_server_values() {
        let base = "Server s {\n type udp\n secret x\n StatusServer VALUE\n}\n";
        assert!(Config::parse(&base.replace("VALUE", "on")).unwrap().servers[0].status_server);
        assert!(!Config::parse(&base.replace("VALUE", "off")).unwrap().servers[0].status_server);
        assert!(Config::parse(&base.replace("VALUE", "maybe")).is_err());
    }

    #[test]
    fn test_listen_syntax() {
        assert_eq!(
            parse_listen("*", 1812).unwrap(),
            ListenAddr {
                host: None,
                port: 1812
            }
        );
        assert_eq!(
            parse_listen("127.0.0.1:2083", 2083).unwrap(),
            ListenAddr {
                host: Some("127.0.0.1".to_string()),
                port: 2083
            }
        );
        assert_eq!(
            parse_listen("[2001:db8::1]:1812", 1812).unwrap(),
            ListenAddr {
                host: Some("2001:db8::1".to_string()),
                port: 1812
            }
        );
        assert_eq!(
            parse_listen("[2001:db8::1]", 1812).unwrap().port,
            1812
        );
        assert!(parse_listen(":1812", 1812).is_err());
        assert!(parse_listen("[2001:db8::1", 1812).is_err());
        assert!(parse_listen("host:notaport", 1812).is_err());
    }

    #[test]
    fn test_log_destination_syntax() {
        assert_eq!(
            parse_log_destination("x-syslog:///LOG_DAEMON").unwrap(),
            LogDestination::Syslog("LOG_DAEMON".to_string())
        );
        assert!(parse_log_destination("tcp://somewhere").is_err());
    }

    #[test]
    fn test_stray_close_brace() {
        assert!(Config::parse("}\n").is_err());
    }
}
