#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use commander_net::{Client, Event, Server};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_server() -> (Server, SocketAddr) {
    let server = Server::new();
    server.set_interface("127.0.0.1").unwrap();
    server.set_port(0).unwrap();
    let addr = server.start().await.unwrap();
    (server, addr)
}

pub fn client(port: u16, client_id: &str) -> Client {
    let client = Client::new();
    client.set_address("127.0.0.1").unwrap();
    client.set_port(port).unwrap();
    client.set_client_id(client_id).unwrap();
    client
}

/// A callback that forwards every event into a channel
pub fn collector() -> (
    impl Fn(&Event) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Event>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |event: &Event| {
        let _ = tx.send(event.clone());
    };
    (callback, rx)
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches
pub async fn wait_for_event<F>(rx: &mut mpsc::UnboundedReceiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for matching event")
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// TCP forwarder whose links can be cut without either endpoint's help
pub struct Proxy {
    port: u16,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl Proxy {
    pub async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let links = Arc::new(Mutex::new(Vec::new()));

        let accept = tokio::spawn({
            let links = links.clone();
            async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    let link = tokio::spawn(async move {
                        if let Ok(mut upstream) = TcpStream::connect(target).await {
                            let _ = copy_bidirectional(&mut inbound, &mut upstream).await;
                        }
                    });
                    links.lock().unwrap().push(link);
                }
            }
        });

        Proxy {
            port,
            links,
            accept,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Drop every forwarded connection
    pub fn sever(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }

    /// Stop accepting; new connections are refused
    pub fn close(&self) {
        self.accept.abort();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.accept.abort();
        self.sever();
    }
}
