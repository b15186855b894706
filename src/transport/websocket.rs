use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::client::Client;
use crate::transport::session::Session;

/// Bind `addr` and serve websocket clients until the listener fails.
pub async fn start_websocket_server(addr: &str, broker: Arc<Broker>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, broker).await;
    Ok(())
}

/// Accept connections on an already bound listener, one task per client.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                spawn(handle_connection(stream, peer, broker.clone()));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake error: {}", e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Create channel for this client
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    let client_id = client.id.clone();
    let mut session = Session::new(broker, client);
    info!(client = %client_id, %peer, "client connected");

    // Forward frames from the session and its consumers to the socket
    let send_client_id = client_id.clone();
    let send_loop = spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                warn!(client = %send_client_id, "Failed to send message: {}", e);
                break;
            }
        }
        debug!(client = %send_client_id, "send loop closed");
    });

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => session.handle_text(&text),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(client = %client_id, "WebSocket read error: {}", e);
                break;
            }
        }
    }

    let requeued = session.close();
    drop(session);
    send_loop.abort();
    info!(client = %client_id, requeued, "client disconnected");
}
