//! Dialplan: destination patterns and ordered actions
//!
//! Rules come from a JSON file. A rule matches the dialed user exactly, or
//! the `*` pattern catches everything that fell through. Actions run in
//! order against the caller's session: play a file, or dial out and bridge.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::media::PlaybackEvent;
use crate::rpc::RpcResponse;
use crate::services::call::{CallService, DialOptions};
use crate::services::leg::Leg;
use crate::services::media_pool::MediaPool;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialplanRule {
    pub pattern: String,
    pub actions: Vec<DialplanAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DialplanAction {
    PlayAudio {
        file: String,
    },
    Dial {
        target: String,
        #[serde(default)]
        timeout: Option<u64>,
    },
    SendDtmf {
        digits: String,
        #[serde(default = "default_digit_duration")]
        duration_ms: u32,
    },
}

fn default_digit_duration() -> u32 {
    200
}

#[derive(Debug, Clone, Default)]
pub struct Dialplan {
    rules: Vec<DialplanRule>,
}

impl Dialplan {
    pub fn from_rules(rules: Vec<DialplanRule>) -> Self {
        Self { rules }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let rules: Vec<DialplanRule> = serde_json::from_str(&content)?;
        Ok(Self { rules })
    }

    /// Exact pattern match first, `*` as the fallback rule.
    pub fn lookup(&self, user: &str) -> Option<&DialplanRule> {
        self.rules
            .iter()
            .find(|r| r.pattern == user)
            .or_else(|| self.rules.iter().find(|r| r.pattern == "*"))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// What the executor knows about the caller while running actions.
pub struct CallSession {
    pub call_id: String,
    pub session_id: String,
    pub leg: Arc<Leg>,
    pub dialed_user: String,
    pub ctx: CancellationToken,
}

pub struct DialplanExecutor {
    call_service: Arc<CallService>,
    media: Arc<MediaPool>,
    default_dial_timeout: Duration,
}

impl DialplanExecutor {
    pub fn new(
        call_service: Arc<CallService>,
        media: Arc<MediaPool>,
        default_dial_timeout: Duration,
    ) -> Self {
        Self {
            call_service,
            media,
            default_dial_timeout,
        }
    }

    /// Run a rule's actions in order. Stops at the first failing action.
    pub async fn execute(&self, session: &CallSession, rule: &DialplanRule) -> Result<()> {
        info!(
            call_id = %session.call_id,
            pattern = %rule.pattern,
            actions = rule.actions.len(),
            "running dialplan"
        );

        for action in &rule.actions {
            if session.ctx.is_cancelled() {
                info!(call_id = %session.call_id, "call gone; dialplan abandoned");
                return Ok(());
            }
            match action {
                DialplanAction::PlayAudio { file } => {
                    self.play_and_wait(session, file).await?;
                }
                DialplanAction::SendDtmf { digits, duration_ms } => {
                    for digit in digits.chars() {
                        self.media
                            .send_dtmf(&session.session_id, digit, *duration_ms)
                            .await?;
                    }
                }
                DialplanAction::Dial { target, timeout } => {
                    let timeout = timeout
                        .map(Duration::from_secs)
                        .unwrap_or(self.default_dial_timeout);
                    let caller_id = session
                        .leg
                        .remote_uri
                        .strip_prefix("sip:")
                        .and_then(|r| r.split('@').next())
                        .map(|s| s.to_string());
                    self.call_service
                        .dial_and_bridge(
                            session.ctx.clone(),
                            Arc::clone(&session.leg),
                            target,
                            timeout,
                            DialOptions {
                                caller_id,
                                caller_name: None,
                                codecs: vec![0],
                            },
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Stream a file to the caller and wait for the playback to finish,
    /// the call to end, or the stream to break.
    async fn play_and_wait(&self, session: &CallSession, file: &str) -> Result<()> {
        let mut events = self.media.play(&session.session_id, file).await?;

        loop {
            tokio::select! {
                _ = session.ctx.cancelled() => {
                    let _ = self.media.stop_audio(&session.session_id).await;
                    return Ok(());
                }
                frame = events.recv() => {
                    let Some(frame) = frame else {
                        return Err(Error::transport("Playback stream closed"));
                    };
                    match frame.response {
                        RpcResponse::Playback(PlaybackEvent::Started { .. }) => {
                            info!(call_id = %session.call_id, file = %file, "playback started");
                        }
                        RpcResponse::Playback(PlaybackEvent::Completed { .. }) => {
                            return Ok(());
                        }
                        RpcResponse::Playback(PlaybackEvent::Error { message, .. }) => {
                            warn!(call_id = %session.call_id, error = %message, "playback failed");
                            return Err(Error::media(message));
                        }
                        RpcResponse::Error { message } => {
                            return Err(Error::media(message));
                        }
                        other => {
                            warn!(call_id = %session.call_id, "unexpected playback frame: {:?}", other);
                        }
                    }
                }
            }
        }
    }
}
