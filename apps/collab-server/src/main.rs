//! Collaboration relay server
//! Routes sync messages between the peers of each project over WebSocket

use anyhow::{anyhow, bail};
use clap::Parser;
use collaboration::{ProjectId, RelayRoom, SyncMessage, UserId};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

type Tx = mpsc::UnboundedSender<SyncMessage>;
type RoomMap = Arc<RwLock<HashMap<ProjectId, RelayRoom>>>;

#[derive(Parser)]
#[command(name = "collab-server")]
#[command(about = "WebSocket relay for collaborative timeline editing")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "COLLAB_ADDR", default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// tracing-subscriber filter directives
    #[arg(
        long,
        env = "COLLAB_LOG",
        default_value = "collab_server=debug,collaboration=debug"
    )]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_filter.as_str())
        .init();

    let listener = TcpListener::bind(args.addr).await?;
    info!("Collaboration server listening on: {}", args.addr);

    let rooms: RoomMap = Arc::new(RwLock::new(HashMap::new()));

    while let Ok((stream, addr)) = listener.accept().await {
        info!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, addr, rooms.clone()));
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, rooms: RoomMap) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SyncMessage>();

    // Task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let mut membership: Option<(ProjectId, UserId)> = None;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = handle_sync_message(&text, &rooms, &tx, &mut membership).await {
                    error!("Error handling message from {}: {}", addr, e);
                    let _ = tx.send(SyncMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
            Message::Close(_) => {
                info!("Client requested close");
                break;
            }
            _ => {}
        }
    }

    if let Some((project_id, user_id)) = membership {
        leave_room(&rooms, &project_id, &user_id).await;
    }

    send_task.abort();
    info!("Connection closed: {}", addr);
}

/// Handles one client frame. The first message must be a `join`.
async fn handle_sync_message(
    text: &str,
    rooms: &RoomMap,
    tx: &Tx,
    membership: &mut Option<(ProjectId, UserId)>,
) -> anyhow::Result<()> {
    let message: SyncMessage = serde_json::from_str(text)?;

    let Some((project_id, user_id)) = membership.clone() else {
        let SyncMessage::Join { project_id, user } = message else {
            bail!("join a project before sending messages");
        };

        info!("User {} joining project {}", user.name, project_id);
        let user_id = user.id.clone();
        rooms
            .write()
            .await
            .entry(project_id.clone())
            .or_insert_with(|| RelayRoom::new(project_id.clone()))
            .join(user, tx.clone())?;
        *membership = Some((project_id, user_id));
        return Ok(());
    };

    match message {
        SyncMessage::Join { .. } => bail!("already joined project {}", project_id),
        SyncMessage::Leave { .. } => {
            leave_room(rooms, &project_id, &user_id).await;
            *membership = None;
        }
        message => {
            debug!("Routing message from {} in {}", user_id, project_id);
            let mut rooms = rooms.write().await;
            rooms
                .get_mut(&project_id)
                .ok_or_else(|| anyhow!("project {} not found", project_id))?
                .route(&user_id, message);
        }
    }

    Ok(())
}

async fn leave_room(rooms: &RoomMap, project_id: &ProjectId, user_id: &UserId) {
    let mut rooms = rooms.write().await;
    if let Some(room) = rooms.get_mut(project_id) {
        if room.leave(user_id) {
            info!("User {} left project {}", user_id, project_id);
        }
        if room.is_empty() {
            info!("Project {} is empty, removing", project_id);
            rooms.remove(project_id);
        }
    }
}
