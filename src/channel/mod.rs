use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::EngineEvent;

pub mod irc;
pub use irc::IrcChannel;

/// Messages the engine asks the control channel to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Ask for the network topology.
    Links,
    /// Ask `server` to list its listeners.
    StatsP { server: String },
    Reply { target: String, text: String },
}

impl Outbound {
    pub fn reply(target: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Reply {
            target: target.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
pub trait ControlChannel {
    /// Connect and shuttle messages until the channel is shut down.
    /// Inbound traffic is translated into engine events.
    async fn run(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<()>;
}
