// Demo: subscribe to a subject, publish a few messages, and drive the
// process loop until everything came back.
use anyhow::{Context, Result};
use clap::Parser;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tether_client::{Client, ClientOptions};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pubsub-demo")]
#[command(about = "Publish/subscribe demo for the tether client")]
struct Args {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Broker port
    #[arg(long, default_value = "4222")]
    port: u16,

    /// Subject to publish and subscribe on
    #[arg(long, default_value = "demo.events")]
    subject: String,

    /// Number of messages to publish
    #[arg(long, default_value = "10")]
    count: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let opts = ClientOptions::new(args.host.clone(), args.port);
    let mut client = Client::connect(opts)
        .with_context(|| format!("connect to {}:{}", args.host, args.port))?;
    info!(host = %args.host, port = args.port, "connected");

    let received: Rc<RefCell<usize>> = Rc::default();
    let sink = Rc::clone(&received);
    client.subscribe(&args.subject, move |msg| {
        info!(subject = %msg.subject, body = %String::from_utf8_lossy(&msg.payload.body), "received");
        *sink.borrow_mut() += 1;
        Ok(None)
    })?;
    client.flush(None)?;

    for index in 0..args.count {
        client.publish(&args.subject, format!("message {index}"))?;
    }
    client.flush(None)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while *received.borrow() < args.count && Instant::now() < deadline {
        client.process(Duration::from_millis(100))?;
    }
    info!(received = *received.borrow(), sent = args.count, "demo complete");
    client.close();
    Ok(())
}
