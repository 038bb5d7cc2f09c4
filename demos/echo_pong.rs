//! Manual smoke test for the server side of the wire protocol: listen for
//! inbound connections and echo every message back on a fresh connection to
//! the sender.
//!
//! RUST_LOG=info cargo run --example echo_pong -- --port 5678

use std::collections::HashMap;
use std::io::Write;

use clap::{App, Arg};

use mux_transport::{EndPointAddress, Event, Transport, TransportConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%6f"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .init();

    let matches = App::new("echo_pong")
        .version("0.1.0")
        .about("Accepts connections and echoes every message back to its sender")
        .arg(
            Arg::with_name("host")
                .takes_value(true)
                .long("host")
                .default_value("127.0.0.1")
                .help("bind host"),
        )
        .arg(
            Arg::with_name("port")
                .takes_value(true)
                .long("port")
                .default_value("0")
                .help("bind port, 0 for an ephemeral port"),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap().to_string();
    let port: u16 = matches.value_of("port").unwrap().parse()?;

    let transport = Transport::bind(host, port, TransportConfig::default()).await?;
    let endpoint = transport.new_endpoint()?;
    eprintln!("listening as {}", endpoint.address());

    let mut senders: HashMap<u32, EndPointAddress> = HashMap::new();

    loop {
        match endpoint.receive().await {
            Ok(Event::ConnectionOpened(id, _reliability, peer)) => {
                log::info!("connection {id} opened from {peer}");
                senders.insert(id, peer);
            }
            Ok(Event::Received(id, chunks)) => {
                let text: Vec<u8> = chunks.into_iter().flatten().collect();
                let text = String::from_utf8_lossy(&text).into_owned();
                println!("received on {id}: {text}");
                if let Some(peer) = senders.get(&id).cloned() {
                    let endpoint = endpoint.clone();
                    tokio::spawn(async move {
                        reply(&endpoint, peer, &text).await;
                    });
                } else {
                    log::warn!("received on {id} from an unknown sender, dropping");
                }
            }
            Ok(Event::ConnectionClosed(id)) => {
                log::info!("connection {id} closed");
                senders.remove(&id);
            }
            Ok(Event::ErrorEvent(kind)) => {
                log::error!("transport error: {kind:?}");
            }
            Ok(Event::EndPointClosed) => {
                eprintln!("endpoint closed");
                return Ok(());
            }
            Err(_) => {
                eprintln!("endpoint closed");
                return Ok(());
            }
        }
    }
}

async fn reply(endpoint: &mux_transport::LocalEndPoint, peer: EndPointAddress, received: &str) {
    let conn = match endpoint.connect(peer.clone(), Default::default()).await {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("failed to open a reply connection to {peer}: {e}");
            return;
        }
    };
    let reply_msg = format!("pong: {received}");
    if let Err(e) = conn.send(vec![reply_msg.into_bytes().into()]).await {
        log::warn!("failed to send reply to {peer}: {e}");
    }
    conn.close().await;
}
