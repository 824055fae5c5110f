//! The `start` command: run a client until told to quit.

use anyhow::{anyhow, Context, Result};
use std::io::BufRead;
use std::sync::mpsc::channel;
use std::thread;
use torchat_net::chat::{ChatEvent, Client};
use torchat_net::reactor::Reactor;
use torchat_net::{Config, OnionAddress};
use tracing::error;

pub fn start(
    config_path: Option<String>,
    onion: Option<String>,
    listen_port: Option<u16>,
    proxy_host: Option<String>,
    proxy_port: Option<u16>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => Config::load(path).with_context(|| format!("loading {path}"))?,
        None => {
            let onion = onion
                .clone()
                .ok_or_else(|| anyhow!("--onion is required without a config file"))?;
            Config::new(OnionAddress::from_string(onion)?)
        }
    };
    if let Some(o) = onion {
        config.onion = OnionAddress::from_string(o)?;
    }
    if let Some(port) = listen_port {
        config.listen_port = port;
    }
    if let Some(host) = proxy_host {
        config.proxy.host = host;
    }
    if let Some(port) = proxy_port {
        config.proxy.port = port;
    }
    config.validate()?;

    let (event_tx, event_rx) = channel();
    let (handle_tx, handle_rx) = channel();

    // The reactor is not Send; it lives and dies on its own thread.
    let reactor_thread = thread::Builder::new()
        .name("reactor".into())
        .spawn(move || {
            let outcome = (|| -> torchat_net::Result<()> {
                let mut reactor = Reactor::new()?;
                let (client, handle) = Client::start(&mut reactor, config, event_tx)?;
                let _ = handle_tx.send(handle);
                reactor.run_with(move |r| client.borrow_mut().drain_commands(r))
            })();
            if let Err(e) = outcome {
                error!(error = %e, "reactor terminated with an error");
            }
        })?;

    let handle = handle_rx.recv().context("client failed to start")?;

    let printer = thread::spawn(move || {
        for event in event_rx {
            match event {
                ChatEvent::ChatEstablished { onion } => {
                    println!("*** chat established with {onion}");
                }
                ChatEvent::Message { onion, text } => println!("<{onion}> {text}"),
                ChatEvent::Status { onion, status } => println!("*** {onion} is now {status}"),
                ChatEvent::ConnectionLost { onion, reason } => {
                    println!("*** lost a connection to {onion}: {reason}");
                }
            }
        }
    });

    println!(
        "torchat {} ready - commands: msg <onion> <text>, quit",
        torchat_net::VERSION
    );
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        match line {
            "" => continue,
            "quit" => break,
            _ => {}
        }
        if let Some(rest) = line.strip_prefix("msg ") {
            match rest.split_once(' ') {
                Some((addr, text)) => match OnionAddress::from_string(addr) {
                    Ok(onion) => handle.send_chat(onion, text.to_owned()),
                    Err(e) => eprintln!("bad address: {e}"),
                },
                None => eprintln!("usage: msg <onion> <text>"),
            }
        } else {
            eprintln!("commands: msg <onion> <text>, quit");
        }
    }

    handle.stop();
    reactor_thread
        .join()
        .map_err(|_| anyhow!("reactor thread panicked"))?;
    printer
        .join()
        .map_err(|_| anyhow!("event printer thread panicked"))?;
    Ok(())
}
