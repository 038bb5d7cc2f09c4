//! Manual smoke test for the client side of the wire protocol: connect to a
//! running `echo_pong`, send one message, and wait for its reply.
//!
//! A reply always arrives on a new inbound connection opened back to us,
//! since a `Connection` handle is only ever returned by `connect()`.
//!
//! RUST_LOG=info cargo run --example echo_ping -- --peer 127.0.0.1:5678:0

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

    let matches = App::new("echo_ping")
        .version("0.1.0")
        .about("Connects to an echo_pong endpoint, sends a message, waits for the reply")
        .arg(
            Arg::with_name("peer")
                .required(true)
                .takes_value(true)
                .long("peer")
                .help("host:service:endpoint-id of the echo_pong endpoint"),
        )
        .arg(
            Arg::with_name("host")
                .takes_value(true)
                .long("host")
                .default_value("127.0.0.1")
                .help("local bind host"),
        )
        .arg(
            Arg::with_name("message")
                .takes_value(true)
                .long("message")
                .default_value("ping")
                .help("message to send"),
        )
        .get_matches();

    let peer_str = matches.value_of("peer").unwrap();
    let peer = EndPointAddress::try_decode(peer_str.as_bytes())
        .map_err(|e| format!("bad --peer address {peer_str}: {e}"))?;
    let host = matches.value_of("host").unwrap().to_string();
    let message = matches.value_of("message").unwrap().to_string();

    let transport = Transport::bind(host, 0, TransportConfig::default()).await?;
    let endpoint = transport.new_endpoint()?;
    println!("local endpoint: {}", endpoint.address());

    println!("connecting to {peer}...");
    let conn = endpoint
        .connect(peer.clone(), Default::default())
        .await
        .map_err(|e| format!("failed to connect: {e}"))?;
    println!("connected, logical connection {}", conn.connection_id());

    conn.send(vec![message.clone().into_bytes().into()]).await?;
    println!("sent: {message}");

    println!("waiting for reply...");
    loop {
        match endpoint.receive().await {
            Ok(Event::Received(id, chunks)) => {
                let text: Vec<u8> = chunks.into_iter().flatten().collect();
                println!("received on {id}: {}", String::from_utf8_lossy(&text));
                break;
            }
            Ok(Event::ErrorEvent(kind)) => {
                return Err(format!("transport reported an error: {kind:?}").into());
            }
            Ok(_) => continue,
            Err(_) => return Err("endpoint closed before a reply arrived".into()),
        }
    }

    conn.close().await;
    endpoint.close().await;
    Ok(())
}
