//! WebSocket transport
//!
//! This file implements the WebSocket server that translates protocol JSON
//! frames into broker operations. Responsibilities:
//! - Accept TCP/WebSocket connections, enforcing the configured frame size
//! - Run one writer task per connection that drains the session's outbound
//!   queue onto the socket
//! - Feed every inbound frame through the connection state machine
//! - Remove the broker session when either side goes away

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async_with_config;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::WebSocketConfig;

use crate::broker::Broker;
use crate::broker::scheduler::lock;
use crate::config::ServerSettings;
use crate::transport::connection::Connection;
use crate::transport::message::Outbound;
use crate::utils::{Result, now_millis};

/// Bind `addr` and serve connections until the listener fails.
pub async fn start_websocket_server(
    addr: String,
    broker: Arc<Mutex<Broker>>,
    settings: ServerSettings,
) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{addr}");
    serve(listener, broker, settings).await
}

pub async fn serve(
    listener: TcpListener,
    broker: Arc<Mutex<Broker>>,
    settings: ServerSettings,
) -> Result<()> {
    let config = WebSocketConfig::default()
        .max_message_size(Some(settings.max_frame_bytes))
        .max_frame_size(Some(settings.max_frame_bytes));

    loop {
        let (stream, peer) = listener.accept().await?;
        let broker = broker.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, broker, config).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Mutex<Broker>>,
    config: WebSocketConfig,
) {
    let ws_stream = match accept_async_with_config(stream, Some(config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error from {peer}: {e}");
            return;
        }
    };
    debug!("Accepted connection from {peer}");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut connection = Connection::new(tx);

    let mut writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode {} frame: {e}", frame.kind());
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                        debug!("Failed to send to {peer}: {e}");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }
        debug!("Send loop closed for {peer}");
    });

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => dispatch(&broker, &mut connection, text.as_bytes()),
                Some(Ok(WsMessage::Binary(bytes))) => dispatch(&broker, &mut connection, &bytes[..]),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read error from {peer}: {e}");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    connection.close(&mut lock(&broker));
    writer.abort();
    info!("{peer} disconnected");
}

fn dispatch(broker: &Mutex<Broker>, connection: &mut Connection, raw: &[u8]) {
    let now = now_millis();
    connection.handle_raw(&mut lock(broker), raw, now);
}
