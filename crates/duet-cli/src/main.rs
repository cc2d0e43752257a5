//! Duet CLI: place and answer calls from the terminal.
//!
//! Media comes from synthetic devices (Opus silence, no camera frames), so
//! the tool exercises signaling and ICE without real hardware.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use duet_call::{
    CallEngine, CallHandle, CallState, Profile, ProfileLookup, StaticIdentity, StaticProfiles,
    SyntheticDevices, WebRtcPeerFactory,
};
use duet_common::config::{load_ice_servers, Timings};
use duet_common::helpers::is_valid_identity;
use duet_common::CallType;
use duet_signal::{ChannelEvent, SignalingChannel, WsConnector};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(about = "Duet calling from the terminal")]
struct Args {
    /// Relay base URL
    #[arg(long, env = "DUET_RELAY_URL", default_value = "ws://127.0.0.1:7860")]
    relay: String,

    /// URL serving the ICE server list; the built-in STUN list is used otherwise
    #[arg(long, env = "DUET_ICE_CONFIG_URL")]
    ice_config_url: Option<String>,

    /// Display name for a peer, as `identity=Name` (repeatable)
    #[arg(long = "contact", value_parser = parse_contact)]
    contacts: Vec<Profile>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a peer and hang up after a while
    Call {
        /// Local identity
        #[arg(short, long, env = "DUET_IDENTITY")]
        identity: String,

        /// Identity to call
        #[arg(short, long)]
        target: String,

        /// Request video as well as audio
        #[arg(long)]
        video: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value_t = 30)]
        duration: u64,
    },

    /// Wait for incoming calls
    Listen {
        /// Local identity
        #[arg(short, long, env = "DUET_IDENTITY")]
        identity: String,

        /// Answer incoming calls automatically
        #[arg(long)]
        auto_accept: bool,

        /// Decline incoming calls instead of letting them ring out
        #[arg(long, conflicts_with = "auto_accept")]
        reject: bool,
    },
}

fn parse_contact(raw: &str) -> Result<Profile, String> {
    let (identity, name) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected identity=Name, got {raw:?}"))?;
    let mut profile = Profile::bare(identity.trim());
    profile.display_name = name.trim().to_string();
    Ok(profile)
}

struct Session {
    channel: SignalingChannel,
    handle: CallHandle,
    engine: JoinHandle<()>,
    profiles: Arc<StaticProfiles>,
}

impl Session {
    async fn start(args: &Args, identity: &str) -> Result<Self> {
        if !is_valid_identity(identity) {
            bail!("invalid identity {identity:?}");
        }
        let timings = Timings::from_env();
        let ice_servers = load_ice_servers(args.ice_config_url.as_deref()).await;
        let peers = Arc::new(WebRtcPeerFactory::new(&ice_servers)?);

        let channel = SignalingChannel::new(Arc::new(WsConnector::new(&args.relay)), timings);
        let mut ready = channel.subscribe();
        let events = channel.subscribe();
        channel.connect(identity);

        timeout(CONNECT_TIMEOUT, async {
            while let Some(event) = ready.recv().await {
                if event == ChannelEvent::Connected(true) {
                    return Ok(());
                }
            }
            Err(anyhow!("signaling channel closed"))
        })
        .await
        .map_err(|_| anyhow!("could not reach relay at {}", args.relay))??;
        drop(ready);
        println!("Connected to {} as {}", args.relay, identity);

        let (engine, handle) = CallEngine::new(
            Arc::new(StaticIdentity::new(identity)),
            Arc::new(channel.clone()),
            Arc::new(SyntheticDevices::new().with_silence(true)),
            peers,
            timings,
        );
        let engine = engine.spawn(events);

        let profiles = args
            .contacts
            .iter()
            .cloned()
            .fold(StaticProfiles::new(), StaticProfiles::with);

        Ok(Self {
            channel,
            handle,
            engine,
            profiles: Arc::new(profiles),
        })
    }

    async fn shutdown(self) {
        if !self.handle.state().is_idle() {
            if let Err(e) = self.handle.end(true).await {
                debug!("hangup during shutdown: {}", e);
            }
        }
        drop(self.handle);
        if let Err(e) = self.engine.await {
            warn!("call engine task failed: {}", e);
        }
        self.channel.disconnect();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    duet_common::init_tracing_with_default("warn");

    let args = Args::parse();

    match &args.command {
        Command::Call {
            identity,
            target,
            video,
            duration,
        } => {
            let session = Session::start(&args, identity).await?;
            let call_type = if *video { CallType::Video } else { CallType::Audio };
            let result = place_call(&session, target, call_type, Duration::from_secs(*duration)).await;
            session.shutdown().await;
            result?;
        }
        Command::Listen {
            identity,
            auto_accept,
            reject,
        } => {
            let session = Session::start(&args, identity).await?;
            let result = listen(&session, *auto_accept, *reject).await;
            session.shutdown().await;
            result?;
        }
    }

    Ok(())
}

async fn place_call(
    session: &Session,
    target: &str,
    call_type: CallType,
    duration: Duration,
) -> Result<()> {
    let handle = &session.handle;
    let mut states = handle.watch_state();
    let mut notices = handle.notices();

    let name = session.profiles.display_name(target).await;
    println!("Calling {} ({})...", name, call_type);
    handle.call(target, call_type).await?;

    let hangup = sleep(Duration::MAX);
    tokio::pin!(hangup);
    let mut hung_up = false;

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    bail!("call engine stopped");
                }
                let state = *states.borrow_and_update();
                println!("State: {}", state);
                match state {
                    CallState::Connected => {
                        print_remote(handle);
                        hangup.as_mut().reset(tokio::time::Instant::now() + duration);
                    }
                    CallState::Idle => return Ok(()),
                    _ => {}
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("Notice: {}", notice),
                Err(RecvError::Lagged(n)) => warn!("missed {} notices", n),
                Err(RecvError::Closed) => bail!("call engine stopped"),
            },
            _ = &mut hangup, if !hung_up => {
                println!("Hanging up");
                hung_up = true;
                handle.end(true).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, hanging up");
                return Ok(());
            }
        }
    }
}

async fn listen(session: &Session, auto_accept: bool, reject: bool) -> Result<()> {
    let handle = &session.handle;
    let mut states = handle.watch_state();
    let mut notices = handle.notices();
    let mut incoming = handle.incoming_calls();

    println!("Waiting for calls (Ctrl-C to quit)");
    loop {
        tokio::select! {
            call = incoming.recv() => match call {
                Ok(call) => {
                    let name = session.profiles.display_name(&call.from).await;
                    println!("Incoming {} call from {}", call.call_type, name);
                    if auto_accept {
                        if let Err(e) = handle.accept().await {
                            println!("Could not answer: {}", e);
                        }
                    } else if reject {
                        handle.reject().await?;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("missed {} incoming calls", n),
                Err(RecvError::Closed) => bail!("call engine stopped"),
            },
            changed = states.changed() => {
                if changed.is_err() {
                    bail!("call engine stopped");
                }
                let state = *states.borrow_and_update();
                println!("State: {}", state);
                if state == CallState::Connected {
                    print_remote(handle);
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("Notice: {}", notice),
                Err(RecvError::Lagged(n)) => warn!("missed {} notices", n),
                Err(RecvError::Closed) => bail!("call engine stopped"),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_remote(handle: &CallHandle) {
    match handle.remote_stream() {
        Some(stream) => {
            let kinds: Vec<String> = stream.tracks.iter().map(|t| t.kind.to_string()).collect();
            println!("Remote stream {} [{}]", stream.id, kinds.join(", "));
        }
        None => println!("No remote media yet"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_contact() {
        let profile = parse_contact("bob = Bob Smith").expect("contact");
        assert_eq!(profile.identity, "bob");
        assert_eq!(profile.display_name, "Bob Smith");
        assert!(parse_contact("bob").is_err());
    }

    #[test]
    fn test_args_parse_call() {
        let args = Args::try_parse_from([
            "duet", "--relay", "ws://relay:7860", "call", "-i", "alice", "-t", "bob", "--video",
        ])
        .expect("args");
        match args.command {
            Command::Call { target, video, duration, .. } => {
                assert_eq!(target, "bob");
                assert!(video);
                assert_eq!(duration, 30);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_listen_flags_conflict() {
        assert!(Args::try_parse_from([
            "duet", "listen", "-i", "bob", "--auto-accept", "--reject",
        ])
        .is_err());
    }
}
