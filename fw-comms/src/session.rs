// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Interactive remote shell on the management controller.
//!
//! Commands are written to a PTY-backed shell and output is collected until
//! an expect pattern (by default, the shell prompt) shows up. This mirrors how
//! an operator drives the controller by hand, and lets us hop to root with
//! `su -` once after login.

use crate::error::SessionError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use russh::client;
use russh::Channel;
use russh::ChannelMsg;
use russh::Disconnect;
use russh_keys::key::PublicKey;
use slog::debug;
use slog::info;
use slog::trace;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Prompt pattern for both unprivileged and root shells.
pub const DEFAULT_PROMPT: &str = r"[\$#] ";

/// How long a command gets to produce its prompt unless the caller says
/// otherwise.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

static DEFAULT_PROMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_PROMPT).expect("valid prompt pattern"));

/// A command channel to the controller.
///
/// Implementations must tolerate `close()` at any point (including while
/// disconnected) followed by a fresh `connect()`.
#[async_trait]
pub trait RemoteSession: Send {
    async fn connect(&mut self) -> Result<(), SessionError>;

    async fn close(&mut self);

    /// Run `cmd` and return its output once `expect` matches.
    ///
    /// Transport failures surface as [`SessionError::SessionLost`].
    async fn send(
        &mut self,
        cmd: &str,
        expect: &str,
        timeout: Duration,
    ) -> Result<String, SessionError>;

    /// Run `cmd`, waiting for the shell prompt with the default timeout.
    async fn run(&mut self, cmd: &str) -> Result<String, SessionError> {
        self.send(cmd, DEFAULT_PROMPT, DEFAULT_COMMAND_TIMEOUT).await
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// If set, `su -` to root with this password after logging in.
    pub root_password: Option<String>,
    pub connect_timeout: Duration,
}

impl SshConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Controllers regenerate their host keys on reflash, so pinning them would
// break every reconnect after an update.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Echo {
    Logged,
    Redacted,
}

struct Connection {
    handle: client::Handle<AcceptAnyHostKey>,
    channel: Channel<client::Msg>,
}

pub struct SshSession {
    config: SshConfig,
    conn: Option<Connection>,
    log: Logger,
}

impl SshSession {
    pub fn new(config: SshConfig, log: Logger) -> Self {
        let log = log.new(slog::o!("session" => config.addr()));
        Self { config, conn: None, log }
    }

    async fn open(&self) -> Result<Connection, SessionError> {
        let addr = self.config.addr();
        let ssh_config = Arc::new(client::Config::default());
        let connect = client::connect(
            ssh_config,
            (self.config.host.as_str(), self.config.port),
            AcceptAnyHostKey,
        );
        let mut handle =
            tokio::time::timeout(self.config.connect_timeout, connect)
                .await
                .map_err(|_elapsed| SessionError::ConnectTimeout {
                    addr: addr.clone(),
                    after: self.config.connect_timeout,
                })?
                .map_err(|err| SessionError::Connect {
                    addr: addr.clone(),
                    err,
                })?;

        let authenticated = handle
            .authenticate_password(
                self.config.user.as_str(),
                self.config.password.as_str(),
            )
            .await
            .map_err(|err| SessionError::Connect { addr: addr.clone(), err })?;
        if !authenticated {
            return Err(SessionError::Auth { user: self.config.user.clone() });
        }

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|err| SessionError::Connect { addr: addr.clone(), err })?;
        channel
            .request_pty(false, "vt100", 200, 50, 0, 0, &[])
            .await
            .map_err(|err| SessionError::Connect { addr: addr.clone(), err })?;
        channel
            .request_shell(true)
            .await
            .map_err(|err| SessionError::Connect { addr, err })?;

        Ok(Connection { handle, channel })
    }

    async fn exchange(
        &mut self,
        cmd: &str,
        expect: &str,
        timeout: Duration,
        echo: Echo,
    ) -> Result<String, SessionError> {
        let conn = self.conn.as_mut().ok_or(SessionError::NotConnected)?;

        let owned;
        let pattern = if expect == DEFAULT_PROMPT {
            &*DEFAULT_PROMPT_RE
        } else {
            owned = Regex::new(expect).map_err(|err| {
                SessionError::InvalidPattern {
                    pattern: expect.to_string(),
                    err,
                }
            })?;
            &owned
        };

        if echo == Echo::Logged {
            trace!(self.log, "sending command"; "cmd" => cmd);
        }
        let line = format!("{cmd}\n");
        if let Err(err) = conn.channel.data(line.as_bytes()).await {
            warn!(self.log, "write to ssh channel failed"; "err" => %err);
            self.conn = None;
            return Err(SessionError::lost(err.to_string()));
        }

        match read_until(&mut conn.channel, pattern, timeout).await {
            Ok(raw) => {
                let output = strip_echo_and_prompt(&raw);
                trace!(self.log, "command output"; "output" => &output);
                Ok(output)
            }
            Err(err) => {
                if err.is_session_lost() {
                    self.conn = None;
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn connect(&mut self) -> Result<(), SessionError> {
        // Never keep two handles to the same controller around.
        self.close().await;

        debug!(self.log, "opening ssh session");
        let mut conn = self.open().await?;
        read_until(
            &mut conn.channel,
            &DEFAULT_PROMPT_RE,
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await?;
        self.conn = Some(conn);

        if let Some(root_password) = self.config.root_password.clone() {
            self.send("su -", "Password:", DEFAULT_COMMAND_TIMEOUT).await?;
            self.exchange(
                &root_password,
                DEFAULT_PROMPT,
                DEFAULT_COMMAND_TIMEOUT,
                Echo::Redacted,
            )
            .await?;
        }
        info!(self.log, "ssh session established");
        Ok(())
    }

    async fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Err(err) = conn
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            // The peer is frequently already gone (that's usually why we're
            // closing), so this is only worth a debug line.
            debug!(self.log, "error closing ssh session"; "err" => %err);
        }
    }

    async fn send(
        &mut self,
        cmd: &str,
        expect: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        self.exchange(cmd, expect, timeout, Echo::Logged).await
    }
}

/// Accumulate channel output until `pattern` matches or `timeout` elapses.
async fn read_until(
    channel: &mut Channel<client::Msg>,
    pattern: &Regex,
    timeout: Duration,
) -> Result<String, SessionError> {
    let deadline = Instant::now() + timeout;
    let mut buffer = String::new();
    loop {
        let msg = match tokio::time::timeout_at(deadline, channel.wait()).await
        {
            Ok(msg) => msg,
            Err(_elapsed) => {
                return Err(SessionError::PatternTimeout {
                    pattern: pattern.as_str().to_string(),
                    after: timeout,
                });
            }
        };
        match msg {
            Some(ChannelMsg::Data { data })
            | Some(ChannelMsg::ExtendedData { data, .. }) => {
                buffer.push_str(&String::from_utf8_lossy(&data));
                if pattern.is_match(&buffer) {
                    return Ok(buffer);
                }
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(SessionError::lost("channel closed by peer"));
            }
            Some(_) => (),
        }
    }
}

/// Drop the echoed command (first line) and the trailing prompt (last line).
pub fn strip_echo_and_prompt(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() <= 2 {
        return String::new();
    }
    lines[1..lines.len() - 1].join("\n").trim().to_string()
}
