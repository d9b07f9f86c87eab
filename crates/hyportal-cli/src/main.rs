//! hyportal - command line front end for the portal.
//!
//! `call` invokes a remote procedure, `listen` prints pushed events, and
//! `serve` runs a demo peer the other two can talk to.

mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hyportal::{
    ConnectionState, Event, HostContext, Notification, Portal, PortalOptions, PortalServer,
    WireCodec,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hyportal")]
#[command(about = "Call procedures and listen for events over a hyportal connection")]
struct Args {
    /// Portal URL (ws, wss, http or https) or a path on --host
    #[arg(long, global = true)]
    url: Option<String>,

    /// host[:port] used to resolve paths and the default endpoint
    #[arg(long, global = true)]
    host: Option<String>,

    /// Resolve against --host with wss instead of ws
    #[arg(long, global = true)]
    secure: bool,

    /// Use the JSON codec instead of MessagePack
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a remote procedure and print its result as JSON
    Call {
        /// Procedure name
        name: String,

        /// Arguments, each parsed as JSON (plain strings need no quotes)
        args: Vec<String>,

        /// Give up on the response after this many seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },

    /// Print events as JSON lines until Ctrl-C
    Listen {
        /// Event names to subscribe to
        #[arg(required = true)]
        events: Vec<String>,
    },

    /// Run a demo peer exposing add, echo and ping
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Emit a "tick" event every N seconds (0 = never)
        #[arg(long, default_value = "0")]
        tick_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine readable
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let codec = if args.json {
        WireCodec::Json
    } else {
        WireCodec::MessagePack
    };

    match &args.command {
        Command::Call {
            name,
            args: call_args,
            timeout_secs,
        } => {
            let options = portal_options(&args, codec)
                .with_call_timeout(Duration::from_secs(*timeout_secs));
            let values = call_args.iter().map(|arg| parse_arg(arg)).collect();
            run_call(options, name, values).await
        }
        Command::Listen { events } => run_listen(portal_options(&args, codec), events).await,
        Command::Serve {
            port,
            bind,
            tick_secs,
        } => run_serve(bind, *port, codec, *tick_secs).await,
    }
}

fn portal_options(args: &Args, codec: WireCodec) -> PortalOptions {
    let mut options = PortalOptions::new().with_codec(codec);
    if let Some(url) = &args.url {
        options = options.with_url(url.clone());
    }
    if let Some(host) = &args.host {
        options = options.with_host(HostContext::new(host.clone(), args.secure));
    }
    options
}

/// Parse a command line argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn event_json(event: &Event) -> Value {
    json!({
        "name": event.name,
        "args": event.args,
        "kwargs": event.kwargs,
    })
}

async fn run_call(options: PortalOptions, name: &str, args: Vec<Value>) -> Result<()> {
    let portal = Portal::new(options).context("Failed to create portal")?;
    info!("Calling '{}' on {}", name, portal.url());

    let result = portal
        .call(name, args)
        .await
        .with_context(|| format!("Call to '{}' failed", name))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    portal.shutdown();
    Ok(())
}

async fn run_listen(options: PortalOptions, events: &[String]) -> Result<()> {
    let portal = Portal::new(options).context("Failed to create portal")?;
    let mut notifications = portal.subscribe();

    for name in events {
        portal.on(name.clone(), |event| println!("{}", event_json(event)));
    }
    info!("Listening for {} on {}", events.join(", "), portal.url());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received, exiting");
                break;
            }
            notification = notifications.recv() => match notification {
                Ok(Notification::Connected) => info!("Connected to {}", portal.url()),
                Ok(Notification::Disconnected) => {
                    if portal.state() != ConnectionState::Idle {
                        warn!("Disconnected from {}, reconnecting", portal.url());
                    }
                }
                Ok(Notification::Event(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} notification(s)", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    portal.shutdown();
    Ok(())
}

async fn run_serve(bind: &str, port: u16, codec: WireCodec, tick_secs: u64) -> Result<()> {
    let functions = demo::functions();
    let exposed = functions.names().join(", ");
    let handle = PortalServer::bind(&format!("{}:{}", bind, port), Arc::new(functions), codec)
        .await
        .context("Failed to start portal server")?;

    // Print the URL for scripts to read (intentional stdout)
    println!("PORTAL_URL={}", handle.url());
    info!("Demo peer exposing {} on {}", exposed, handle.addr());

    let ticking = tick_secs > 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(tick_secs.max(1)));
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received, exiting");
                break;
            }
            _ = ticker.tick(), if ticking => {
                ticks += 1;
                let sent = handle.emit("tick", vec![json!(ticks)], Default::default())?;
                info!("tick {} sent to {} client(s)", ticks, sent);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("5"), json!(5));
        assert_eq!(parse_arg("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_arg("{\"a\": true}"), json!({"a": true}));
        assert_eq!(parse_arg("\"quoted\""), json!("quoted"));
        assert_eq!(parse_arg("plain"), json!("plain"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "hyportal", "call", "add", "2", "3", "--url", "ws://localhost:8000/_hy/ws", "--json",
        ])
        .unwrap();

        assert!(args.json);
        let options = portal_options(&args, WireCodec::Json);
        assert_eq!(options.url.as_deref(), Some("ws://localhost:8000/_hy/ws"));
        assert_eq!(options.codec, WireCodec::Json);
        match args.command {
            Command::Call { name, args, timeout_secs } => {
                assert_eq!(name, "add");
                assert_eq!(args, vec!["2", "3"]);
                assert_eq!(timeout_secs, 30);
            }
            other => panic!("Expected call, got: {:?}", other),
        }
    }

    #[test]
    fn test_host_flags_build_context() {
        let args =
            Args::try_parse_from(["hyportal", "--host", "example.com", "--secure", "listen", "message"])
                .unwrap();
        let options = portal_options(&args, WireCodec::MessagePack);
        assert_eq!(options.host, Some(HostContext::new("example.com", true)));
        assert!(options.url.is_none());
    }

    #[test]
    fn test_event_json() {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("room".to_string(), json!("lobby"));
        let event = Event::new("message", vec![json!("hi")], kwargs);

        assert_eq!(
            event_json(&event),
            json!({"name": "message", "args": ["hi"], "kwargs": {"room": "lobby"}})
        );
    }

    #[tokio::test]
    async fn test_serve_answers_demo_calls() {
        let handle = PortalServer::start(Arc::new(demo::functions()), WireCodec::MessagePack)
            .await
            .unwrap();
        let portal = Portal::new(PortalOptions::new().with_url(handle.url())).unwrap();

        let sum = tokio::time::timeout(Duration::from_secs(10), portal.call("add", vec![json!(2), json!(3)]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sum, json!(5));
    }
}
