//! Network runners for the `server` and `client` subcommands
//!
//! Both read stdin line by line and send each line as an `echo` message.

use commander_net::{Client, ClientConfig, Event, EventKind, Message, Server, ServerConfig, BROADCAST};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Build the `echo` message sent for a line of input
pub fn echo(line: &str) -> commander_net::Result<Message> {
    Message::from_value("echo", json!({ "message": line }))
}

/// Render an event as one line of output
pub fn describe(event: &Event) -> String {
    match event {
        Event::Connect { client_id } => format!("connect {}", client_id),
        Event::Disconnect { client_id } => format!("disconnect {}", client_id),
        Event::Reconnect { client_id } => format!("reconnect {}", client_id),
        Event::Message { origin, message } => {
            let payload = serde_json::Value::Object(message.payload().clone());
            match origin {
                Some(origin) => format!("message from {}: {} {}", origin, message.subject(), payload),
                None => format!("message: {} {}", message.subject(), payload),
            }
        }
        Event::ServerShutdown => "server shutdown".to_string(),
        Event::StateChange { client_id, transition } => match client_id {
            Some(id) => format!("state [{}] {}", id, transition),
            None => format!("state {}", transition),
        },
    }
}

/// Host a server until stdin closes or Ctrl-C
pub async fn run_server(config: ServerConfig) -> AppResult<()> {
    let server = Server::with_config(config);
    for kind in [EventKind::Connect, EventKind::Disconnect, EventKind::Message] {
        server.on(kind, |event| println!("{}", describe(event)));
    }

    let addr = server.start().await?;
    info!(addr = %addr, "Listening; each input line is broadcast as 'echo'");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(e) = server.send(BROADCAST, echo(&line)?).await {
                    warn!(error = %e, "Broadcast failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    server.stop().await?;
    server.flush_events().await;
    Ok(())
}

/// Connect as a client until the server shuts down, stdin closes, or Ctrl-C
pub async fn run_client(config: ClientConfig) -> AppResult<()> {
    let client = Client::with_config(config);
    if client.client_id().is_none() {
        client.set_client_id(client.generate_id())?;
    }

    for kind in [
        EventKind::Connect,
        EventKind::Reconnect,
        EventKind::Disconnect,
        EventKind::Message,
    ] {
        client.on(kind, |event| println!("{}", describe(event)));
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    client.on(EventKind::ServerShutdown, move |event| {
        println!("{}", describe(event));
        let _ = shutdown_tx.send(());
    });

    info!(client_id = ?client.client_id(), "Starting client");
    client.connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        if let Err(e) = client.send(echo(&line)?) {
                            warn!(error = %e, "Send failed");
                        }
                    }
                    // Keep listening after stdin closes
                    None => stdin_open = false,
                }
            }
            _ = shutdown_rx.recv() => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.disconnect().await?;
    client.flush_events().await;
    Ok(())
}
