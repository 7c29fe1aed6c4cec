//! Line-oriented stdin console.

use std::collections::HashSet;
use std::sync::Arc;

use mesh_core::{
    DeliveryState, MeshHandler, MessageStore, PeerId, StoredMessage,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Peers,
    Contacts,
    Send { peer: PeerId, body: String },
    Quit,
    Help,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("usage: send <peer> <text>")]
    SendUsage,
    #[error("unknown command {0:?} (try help)")]
    Unknown(String),
}

pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let cmd = match word {
        "" => return Ok(None),
        "peers" => Command::Peers,
        "contacts" => Command::Contacts,
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        "send" => {
            let (peer, body) = rest.split_once(char::is_whitespace).ok_or(ParseError::SendUsage)?;
            let body = body.trim();
            if body.is_empty() {
                return Err(ParseError::SendUsage);
            }
            Command::Send {
                peer: PeerId::from(peer),
                body: body.to_owned(),
            }
        }
        other => return Err(ParseError::Unknown(other.to_owned())),
    };
    Ok(Some(cmd))
}

/// Read commands until `quit`. On EOF (e.g. running as a service) the
/// console goes quiet and this never returns.
pub async fn run(handler: Arc<MeshHandler>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = match parse(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match cmd {
            Command::Quit => return Ok(()),
            Command::Help => println!("commands: peers | contacts | send <peer> <text> | quit"),
            Command::Peers => {
                let peers = handler.connected_peers().borrow().clone();
                if peers.is_empty() {
                    println!("no connected peers");
                }
                for peer in peers {
                    println!("{peer}");
                }
            }
            Command::Contacts => {
                for c in handler.conversations().await? {
                    let status = if c.connected { "online" } else { "offline" };
                    println!(
                        "{} ({}) {} last: {}",
                        c.display_name,
                        c.peer_id,
                        status,
                        c.last_message.as_deref().unwrap_or("-"),
                    );
                }
            }
            Command::Send { peer, body } => {
                let id = Uuid::new_v4();
                let mut states = handler.send_message(peer.clone(), body, id).await?;
                tokio::spawn(async move {
                    while let Some(state) = states.recv().await {
                        println!("[{peer}] {id}: {state:?}");
                    }
                });
            }
        }
    }
    std::future::pending::<()>().await;
    Ok(())
}

/// Log each newly received chat as it lands in the store.
pub async fn log_incoming(store: Arc<dyn MessageStore>) {
    let mut rx: watch::Receiver<Vec<StoredMessage>> = store.watch_messages();
    let mut seen: HashSet<Uuid> = HashSet::new();
    while rx.changed().await.is_ok() {
        let fresh: Vec<StoredMessage> = rx
            .borrow_and_update()
            .iter()
            .filter(|m| m.delivery_state == DeliveryState::None && !seen.contains(&m.uuid))
            .cloned()
            .collect();
        for m in fresh {
            seen.insert(m.uuid);
            tracing::info!(from = %m.origin_peer_id, body = %m.body, "chat received");
        }
    }
}
