//! Textual controller for one client and one server
//!
//! Lines are parsed into a [`Command`] by [`parse`], which has no side
//! effects, then run against the engines by [`Repl::execute`].

use std::fmt;

use commander_net::{
    Client, ClientConfig, Error, EventKind, Message, Payload, ReconnectPolicy, Server,
    ServerConfig,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::network::describe;

pub const HELP: &str = "\
commands:
  client set <address|port|id|interface|bind_port|reconnect> <value>
  client get <field>
  client connect | disconnect | status | genid
  client send <subject> [key=value ...]
  server set <interface|port> <value>
  server get <field>
  server start | stop | status
  server send <target|*> <subject> [key=value ...]
  help
  quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Address,
    Port,
    Id,
    Interface,
    BindPort,
    Reconnect,
}

impl Field {
    fn parse(role: Role, name: &str) -> Result<Self, ParseError> {
        let normalized: String = name
            .to_lowercase()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect();
        let field = match normalized.as_str() {
            "address" => Field::Address,
            "port" => Field::Port,
            "id" | "clientid" => Field::Id,
            "interface" => Field::Interface,
            "bindport" => Field::BindPort,
            "reconnect" => Field::Reconnect,
            _ => return Err(ParseError::UnknownField(name.to_string())),
        };

        let allowed = match role {
            Role::Client => true,
            Role::Server => matches!(field, Field::Interface | Field::Port),
        };
        if !allowed {
            return Err(ParseError::NotApplicable {
                role,
                field: name.to_string(),
            });
        }
        Ok(field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set { role: Role, field: Field, value: String },
    Get { role: Role, field: Field },
    Connect,
    Disconnect,
    GenerateId,
    Start,
    Stop,
    Status(Role),
    ClientSend(Message),
    ServerSend { target: String, message: Message },
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown command '{0}', try 'help'")]
    UnknownCommand(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("unexpected argument '{0}'")]
    Unexpected(String),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("{role} has no field '{field}'")]
    NotApplicable { role: Role, field: String },
    #[error("expected key=value, got '{0}'")]
    BadPair(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Parse one input line
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut words = line.split_whitespace();
    let head = words.next().ok_or(ParseError::Empty)?;

    let command = match head {
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "client" => parse_client(&mut words)?,
        "server" => parse_server(&mut words)?,
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };

    if let Some(extra) = words.next() {
        return Err(ParseError::Unexpected(extra.to_string()));
    }
    Ok(command)
}

fn parse_client<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<Command, ParseError> {
    let action = words.next().ok_or(ParseError::Missing("client action"))?;
    match action {
        "set" | "get" => parse_field_access(Role::Client, action, words),
        "connect" => Ok(Command::Connect),
        "disconnect" => Ok(Command::Disconnect),
        "status" => Ok(Command::Status(Role::Client)),
        "genid" => Ok(Command::GenerateId),
        "send" => {
            let subject = words.next().ok_or(ParseError::Missing("subject"))?;
            Ok(Command::ClientSend(parse_message(subject, words)?))
        }
        other => Err(ParseError::UnknownCommand(format!("client {}", other))),
    }
}

fn parse_server<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<Command, ParseError> {
    let action = words.next().ok_or(ParseError::Missing("server action"))?;
    match action {
        "set" | "get" => parse_field_access(Role::Server, action, words),
        "start" => Ok(Command::Start),
        "stop" => Ok(Command::Stop),
        "status" => Ok(Command::Status(Role::Server)),
        "send" => {
            let target = words.next().ok_or(ParseError::Missing("target"))?;
            let subject = words.next().ok_or(ParseError::Missing("subject"))?;
            Ok(Command::ServerSend {
                target: target.to_string(),
                message: parse_message(subject, words)?,
            })
        }
        other => Err(ParseError::UnknownCommand(format!("server {}", other))),
    }
}

fn parse_field_access<'a>(
    role: Role,
    action: &str,
    words: &mut impl Iterator<Item = &'a str>,
) -> Result<Command, ParseError> {
    let name = words.next().ok_or(ParseError::Missing("field"))?;
    let field = Field::parse(role, name)?;
    if action == "get" {
        return Ok(Command::Get { role, field });
    }
    let value = words.next().ok_or(ParseError::Missing("value"))?;
    Ok(Command::Set {
        role,
        field,
        value: value.to_string(),
    })
}

/// `key=value` pairs; values that parse as JSON keep their type
fn parse_message<'a>(
    subject: &str,
    pairs: &mut impl Iterator<Item = &'a str>,
) -> Result<Message, ParseError> {
    let mut payload = Payload::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .filter(|(key, _)| !key.is_empty())
            .ok_or_else(|| ParseError::BadPair(pair.to_string()))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        payload.insert(key.to_string(), value);
    }
    Message::new(subject, payload).map_err(|e| ParseError::InvalidMessage(e.to_string()))
}

/// What the caller should do after a command
#[derive(Debug, PartialEq)]
pub enum Reply {
    Text(String),
    Done,
    Quit,
}

/// One client and one server driven by commands
pub struct Repl {
    client: Client,
    server: Server,
}

impl Repl {
    pub fn new(client: ClientConfig, server: ServerConfig) -> Self {
        Repl {
            client: Client::with_config(client),
            server: Server::with_config(server),
        }
    }

    /// Print engine events as they happen
    pub fn echo_events(&self) {
        let kinds = [
            EventKind::Connect,
            EventKind::Disconnect,
            EventKind::Reconnect,
            EventKind::Message,
            EventKind::ServerShutdown,
        ];
        for kind in kinds {
            self.client
                .on(kind, |event| println!("[client] {}", describe(event)));
        }
        for kind in kinds {
            self.server
                .on(kind, |event| println!("[server] {}", describe(event)));
        }
    }

    #[cfg(test)]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[cfg(test)]
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub async fn execute(&self, command: Command) -> Result<Reply, Error> {
        debug!(?command, "Executing");
        match command {
            Command::Help => Ok(Reply::Text(HELP.to_string())),
            Command::Quit => Ok(Reply::Quit),
            Command::Set { role, field, value } => {
                self.set(role, field, &value)?;
                Ok(Reply::Done)
            }
            Command::Get { role, field } => Ok(Reply::Text(self.get(role, field))),
            Command::Connect => {
                self.client.connect().await?;
                Ok(Reply::Done)
            }
            Command::Disconnect => {
                self.client.disconnect().await?;
                Ok(Reply::Done)
            }
            Command::GenerateId => Ok(Reply::Text(self.client.generate_id())),
            Command::Start => {
                let addr = self.server.start().await?;
                Ok(Reply::Text(format!("listening on {}", addr)))
            }
            Command::Stop => {
                self.server.stop().await?;
                Ok(Reply::Done)
            }
            Command::Status(Role::Client) => {
                Ok(Reply::Text(format!("client: {}", self.client.state())))
            }
            Command::Status(Role::Server) => {
                let sessions = self.server.sessions().await;
                let addr = self
                    .server
                    .local_addr()
                    .map_or_else(|| "-".to_string(), |a| a.to_string());
                Ok(Reply::Text(format!(
                    "server: {} addr: {} sessions: [{}]",
                    self.server.state(),
                    addr,
                    sessions.join(", ")
                )))
            }
            Command::ClientSend(message) => {
                self.client.send(message)?;
                Ok(Reply::Done)
            }
            Command::ServerSend { target, message } => {
                self.server.send(&target, message).await?;
                Ok(Reply::Done)
            }
        }
    }

    fn set(&self, role: Role, field: Field, value: &str) -> Result<(), Error> {
        match (role, field) {
            (Role::Client, Field::Address) => self.client.set_address(value),
            (Role::Client, Field::Port) => self.client.set_port(parse_port(value)?),
            (Role::Client, Field::Id) => self.client.set_client_id(value),
            (Role::Client, Field::Interface) => {
                self.client.set_interface(optional(value).map(str::to_string))
            }
            (Role::Client, Field::BindPort) => {
                let port = optional(value).map(parse_port).transpose()?;
                self.client.set_bind_port(port)
            }
            (Role::Client, Field::Reconnect) => {
                let enabled = parse_switch(value)?;
                let policy = ReconnectPolicy {
                    enabled,
                    ..self.client.config().reconnect
                };
                self.client.set_reconnect_policy(policy)
            }
            (Role::Server, Field::Interface) => self.server.set_interface(value),
            (Role::Server, Field::Port) => self.server.set_port(parse_port(value)?),
            (Role::Server, other) => Err(Error::Configuration(format!(
                "server has no field {:?}",
                other
            ))),
        }
    }

    fn get(&self, role: Role, field: Field) -> String {
        fn show<T: ToString>(value: Option<T>) -> String {
            value.map_or_else(|| "(unset)".to_string(), |v| v.to_string())
        }

        match role {
            Role::Client => {
                let config = self.client.config();
                match field {
                    Field::Address => show(config.address),
                    Field::Port => show(config.port),
                    Field::Id => show(config.client_id),
                    Field::Interface => show(config.interface),
                    Field::BindPort => show(config.bind_port),
                    Field::Reconnect => (if config.reconnect.enabled { "on" } else { "off" }).to_string(),
                }
            }
            Role::Server => match field {
                Field::Interface => show(self.server.interface()),
                Field::Port => show(self.server.port()),
                _ => "(unset)".to_string(),
            },
        }
    }

    /// Read commands from stdin until `quit` or end of input
    pub async fn run(&self) -> std::io::Result<()> {
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let command = match parse(&line) {
                Ok(command) => command,
                Err(ParseError::Empty) => continue,
                Err(e) => {
                    println!("error: {}", e);
                    continue;
                }
            };

            match self.execute(command).await {
                Ok(Reply::Text(text)) => println!("{}", text),
                Ok(Reply::Done) => {}
                Ok(Reply::Quit) => break,
                Err(e) => println!("error: {}", e),
            }
        }

        self.client.disconnect().await.map_err(std::io::Error::other)?;
        self.server.stop().await.map_err(std::io::Error::other)?;
        Ok(())
    }
}

fn parse_port(value: &str) -> Result<u16, Error> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("Invalid port '{}'", value)))
}

fn parse_switch(value: &str) -> Result<bool, Error> {
    match value.to_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(Error::Configuration(format!("Expected on or off, got '{}'", value))),
    }
}

/// `none` or `-` clears an optional field
fn optional(value: &str) -> Option<&str> {
    match value {
        "none" | "-" => None,
        other => Some(other),
    }
}
