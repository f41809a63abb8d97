//! UDP transport and event loop: socket, console input, timers and shutdown all
//! feed the one `OverlayCore` owned by this task.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use partyline_core::wire::MAX_DATAGRAM_LEN;
use partyline_core::{BootstrapToken, OutboundAction, OverlayCore, SendError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::console::{self, Command};

/// Longest sleep between ticks when nothing is scheduled.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

enum Flow {
    Continue,
    Exit,
}

pub struct Node {
    core: OverlayCore,
    socket: UdpSocket,
}

impl Node {
    pub async fn bind(core: OverlayCore, bind: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("binding UDP socket on {bind}"))?;
        info!(addr = %socket.local_addr()?, id = %core.id().short(), "listening");
        Ok(Self { core, socket })
    }

    pub fn core(&self) -> &OverlayCore {
        &self.core
    }

    pub async fn join(&mut self, token: BootstrapToken) -> anyhow::Result<()> {
        let actions = self.core.join(token)?;
        self.execute(actions).await;
        Ok(())
    }

    /// Run until the user leaves or Ctrl-C. A failed bootstrap verification is
    /// returned as an error.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            let pause = self.pause();
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP port unreachable from a vanished peer surfaces here on some platforms.
                            debug!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    let actions = self.core.on_datagram(&buf[..n], from, now_ms())?;
                    self.execute(actions).await;
                }
                _ = tokio::time::sleep(pause) => {
                    let actions = self.core.tick(now_ms());
                    self.execute(actions).await;
                }
                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => {
                            if let Flow::Exit = self.command(&line).await {
                                return Ok(());
                            }
                        }
                        Ok(None) => stdin_open = false,
                        Err(e) => {
                            warn!(error = %e, "console read failed");
                            stdin_open = false;
                        }
                    }
                }
                _ = &mut shutdown => {
                    self.leave().await;
                    return Ok(());
                }
            }
        }
    }

    fn pause(&self) -> Duration {
        match self.core.next_deadline() {
            Some(due) => Duration::from_millis(due.saturating_sub(now_ms())).min(IDLE_TICK),
            None => IDLE_TICK,
        }
    }

    async fn command(&mut self, line: &str) -> Flow {
        let cmd = match console::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                println!("! {e:#}");
                return Flow::Continue;
            }
        };
        let result = match cmd {
            Command::Nothing => return Flow::Continue,
            Command::Help => {
                println!("{}", console::HELP);
                return Flow::Continue;
            }
            Command::Id => {
                println!("{}", console::render_id(&self.core));
                return Flow::Continue;
            }
            Command::Peers => {
                println!("{}", console::render_peers(&self.core));
                return Flow::Continue;
            }
            Command::Keys => {
                println!("{}", console::render_keys(&self.core));
                return Flow::Continue;
            }
            Command::Leave => {
                self.leave().await;
                return Flow::Exit;
            }
            Command::Bootstrap(token) => self.core.join(token),
            Command::Open(id) => self.core.setup_secure(id),
            Command::Msg(id, text) => self.core.send_private_message(id, &text, now_ms()),
            Command::Chat(text) => self.core.send_chat(&text, now_ms()),
        };
        match result {
            Ok(actions) => self.execute(actions).await,
            Err(SendError::NotJoined) => println!("! join a network first: /bs <token>"),
            Err(e) => println!("! {e}"),
        }
        Flow::Continue
    }

    async fn leave(&mut self) {
        match self.core.leave() {
            Ok(actions) => self.execute(actions).await,
            Err(e) => debug!(error = %e, "leave"),
        }
    }

    async fn execute(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::SendDatagram { to, bytes } => {
                    if let Err(e) = self.socket.send_to(&bytes, to).await {
                        debug!(%to, error = %e, "send_to failed");
                    }
                }
                OutboundAction::Status(line) => println!("* {line}"),
                OutboundAction::Chat(entry) => println!("{}", console::render_chat(&entry)),
            }
        }
    }
}
