//! Connection supervisor: one token and one plan, fanned out to every channel.
//!
//! All five channels share the same room. Changing the token or the plan is
//! applied to each channel in turn; the channels themselves take care of
//! (re)connecting and swapping their subscriptions.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use super::{Domain, PlanId, SyncResult};
use crate::channel::{
    ChannelEvent, ChannelManager, ChannelOptions, ConnectionState, Connector, MIN_TOKEN_LEN,
};

/// Status of one channel, as reported to the agent API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub domain: Domain,
    pub state: ConnectionState,
    pub plan_id: Option<PlanId>,
    pub queued: usize,
}

pub struct ConnectionSupervisor {
    channels: Vec<ChannelManager>,
    token: RwLock<Option<String>>,
    plan_id: RwLock<Option<PlanId>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionSupervisor {
    /// Spawn a channel per domain. Channels stay idle until a token is set.
    pub fn new(
        options: ChannelOptions,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let channels = Domain::ALL
            .iter()
            .map(|&domain| {
                ChannelManager::spawn(
                    domain,
                    options.clone(),
                    connector.clone(),
                    events.clone(),
                    shutdown_tx.subscribe(),
                )
            })
            .collect();

        Self {
            channels,
            token: RwLock::new(None),
            plan_id: RwLock::new(None),
            shutdown_tx,
        }
    }

    pub fn channel(&self, domain: Domain) -> &ChannelManager {
        // channels are spawned in Domain::ALL order
        let index = Domain::ALL.iter().position(|&d| d == domain).unwrap_or(0);
        &self.channels[index]
    }

    pub fn channels(&self) -> &[ChannelManager] {
        &self.channels
    }

    /// A usable token, if any
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn plan_id(&self) -> Option<PlanId> {
        *self.plan_id.read()
    }

    /// Install, refresh or clear the access token on every channel
    pub fn set_token(&self, token: Option<String>) {
        let token = token.filter(|t| t.len() >= MIN_TOKEN_LEN);
        {
            let mut current = self.token.write();
            if *current == token {
                return;
            }
            match (&*current, &token) {
                (None, Some(_)) => info!("Access token available, activating channels"),
                (Some(_), Some(_)) => info!("Access token refreshed, reconnecting channels"),
                (Some(_), None) => info!("Access token cleared, deactivating channels"),
                (None, None) => {}
            }
            *current = token.clone();
        }

        for channel in &self.channels {
            channel.set_token(token.clone());
        }
    }

    /// Point every channel at a plan (or none)
    pub fn set_plan(&self, plan_id: Option<PlanId>) {
        {
            let mut current = self.plan_id.write();
            if *current == plan_id {
                return;
            }
            match plan_id {
                Some(id) => info!("Switching channels to plan {}", id),
                None => warn!("Plan cleared, channels will not subscribe"),
            }
            *current = plan_id;
        }

        for channel in &self.channels {
            channel.subscribe(plan_id);
        }
    }

    pub fn connect(&self) {
        for channel in &self.channels {
            channel.connect();
        }
    }

    pub fn disconnect(&self) {
        *self.token.write() = None;
        for channel in &self.channels {
            channel.disconnect();
        }
    }

    /// Publish on one channel
    pub fn send(&self, domain: Domain, body: String) -> SyncResult<()> {
        self.channel(domain).send(body)
    }

    pub fn statuses(&self) -> Vec<ChannelStatus> {
        self.channels
            .iter()
            .map(|channel| ChannelStatus {
                domain: channel.domain(),
                state: channel.state(),
                plan_id: channel.room(),
                queued: channel.outbox_len(),
            })
            .collect()
    }

    pub fn all_connected(&self) -> bool {
        self.channels
            .iter()
            .all(|c| c.state() == ConnectionState::Connected)
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every driver and wait for them to close their sockets
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        for channel in &self.channels {
            channel.join().await;
        }
        info!("All channels stopped");
    }
}
