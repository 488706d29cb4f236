//! CLI for topicd
//!
//! Subcommands:
//! - `server`: run the broker and its WebSocket server
//! - `client`: run a small smoke-test client against a running broker
//! - `export`: print the stored router and auth resources as YAML documents

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

use topicd::broker::Broker;
use topicd::broker::scheduler::{lock, spawn_background};
use topicd::config::{Settings, load_config};
use topicd::persistence::documents::{ResourceKind, export_documents, parse_documents, stored_documents};
use topicd::persistence::open_backend;
use topicd::transport::message::ServerFrame;
use topicd::transport::websocket::start_websocket_server;
use topicd::utils::{logging, now_millis};

#[derive(Parser)]
#[command(name = "topicd")]
enum Command {
    /// Start the broker
    Server,
    /// Run the smoke-test client (hello, subscribe, publish, ack)
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value = "smoke.test")]
        topic: String,
    },
    /// Print every stored resource as one YAML document stream
    Export,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Server => run_server(settings).await,
        Command::Client { url, topic } => run_client(&url, &topic).await,
        Command::Export => run_export(&settings),
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn Error>> {
    let backend = open_backend(&settings.storage)?;
    let mut broker = Broker::new(settings.broker.clone(), backend);

    match &settings.storage.resources_file {
        Some(path) => {
            let docs = parse_documents(&std::fs::read_to_string(path)?)?;
            let imported = broker.import_resources(&docs)?;
            info!("Imported {imported} resource documents from {path}");
        }
        None => broker.load_resources()?,
    }
    broker.restore(now_millis())?;

    let broker = Arc::new(Mutex::new(broker));
    let tasks = spawn_background(broker.clone(), &settings.broker);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    tokio::select! {
        result = start_websocket_server(addr, broker.clone(), settings.server.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server exited unexpectedly: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    for task in tasks {
        task.abort();
    }
    lock(&broker).close()?;
    Ok(())
}

fn run_export(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let backend = open_backend(&settings.storage)?;
    let mut docs = Vec::new();
    for kind in ResourceKind::ALL {
        docs.extend(stored_documents(backend.as_ref(), kind)?);
    }
    print!("{}", export_documents(&docs, chrono::Utc::now())?);
    Ok(())
}

async fn run_client(url: &str, topic: &str) -> Result<(), Box<dyn Error>> {
    let (mut ws_stream, _response) = connect_async(url).await?;

    let hello = json!({"hello": {"clientId": "topicd-smoke", "version": env!("CARGO_PKG_VERSION"), "maxWorkers": 1}});
    ws_stream.send(WsMessage::Text(hello.to_string().into())).await?;

    let subscribe = json!({"subscribe": {"topics": [topic]}});
    ws_stream.send(WsMessage::Text(subscribe.to_string().into())).await?;

    let publish = json!({"publish": {
        "topic": topic,
        "message": {"text": "Hello from topicd"},
        "options": {"qos": "feedback"}
    }});
    ws_stream.send(WsMessage::Text(publish.to_string().into())).await?;

    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), ws_stream.next()).await?;
        let Some(msg) = next else {
            println!("Connection closed by broker");
            break;
        };
        let WsMessage::Text(text) = msg? else {
            continue;
        };
        println!("Received: {text}");

        match serde_json::from_str::<ServerFrame>(text.as_str())? {
            ServerFrame::Welcome {
                error_message: Some(reason),
                ..
            } => return Err(format!("handshake refused: {reason}").into()),
            ServerFrame::Delivery { options, .. } => {
                let ack = json!({"deliveryAck": {"messageId": options.message_id, "percent": 100}});
                ws_stream.send(WsMessage::Text(ack.to_string().into())).await?;
            }
            ServerFrame::DeliveryReport { .. } => break,
            _ => {}
        }
    }

    ws_stream.close(None).await?;
    Ok(())
}
