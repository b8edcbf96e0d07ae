use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentRole, DiscoveryConfig};
use crate::error::{Result, SkysweepError};
use crate::queue::task::to_delta;

/// Announcement wire version. Receivers ignore datagrams from the future
/// instead of failing on them.
pub const PROTOCOL_VERSION: u32 = 1;

/// Periodic presence datagram, JSON-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub agent_id: String,
    pub role: AgentRole,
    pub protocol_version: u32,
    /// Port of the agent's pull-based status surface.
    pub status_port: u16,
}

/// A peer agent as last seen on the wire.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub agent_id: String,
    /// Source address of the last announcement.
    pub address: SocketAddr,
    pub role: AgentRole,
    pub status_port: u16,
    pub last_announced_at: DateTime<Utc>,
}

impl AgentDescriptor {
    pub fn status_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.status_port)
    }
}

/// The live set of discovered peers. Entries are refreshed by each
/// announcement and removed once silent past the timeout; a removed agent
/// only returns with a fresh announcement.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentDescriptor>>,
    silence_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(silence_timeout: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            silence_timeout,
        }
    }

    pub async fn observe(&self, ann: Announcement, src: SocketAddr, now: DateTime<Utc>) {
        let mut agents = self.agents.write().await;
        match agents.get_mut(&ann.agent_id) {
            Some(existing) => {
                existing.address = src;
                existing.role = ann.role;
                existing.status_port = ann.status_port;
                existing.last_announced_at = now;
            }
            None => {
                tracing::info!(agent = %ann.agent_id, addr = %src, role = %ann.role, "Peer agent discovered");
                agents.insert(
                    ann.agent_id.clone(),
                    AgentDescriptor {
                        agent_id: ann.agent_id,
                        address: src,
                        role: ann.role,
                        status_port: ann.status_port,
                        last_announced_at: now,
                    },
                );
            }
        }
    }

    /// Drop agents silent for longer than the timeout. Returns the removed
    /// ids; each agent expires at most once per disappearance.
    pub async fn expire_silent(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - to_delta(self.silence_timeout);
        let mut agents = self.agents.write().await;
        let expired: Vec<String> = agents
            .values()
            .filter(|a| a.last_announced_at < cutoff)
            .map(|a| a.agent_id.clone())
            .collect();
        for id in &expired {
            agents.remove(id);
            tracing::info!(agent = %id, "Peer agent expired from discovery");
        }
        expired
    }

    pub async fn active(&self) -> Vec<AgentDescriptor> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

/// Decode an announcement datagram, dropping malformed payloads and any
/// protocol version newer than ours.
pub(crate) fn parse_announcement(data: &[u8]) -> Option<Announcement> {
    let ann: Announcement = serde_json::from_slice(data).ok()?;
    if ann.protocol_version > PROTOCOL_VERSION {
        tracing::trace!(
            version = ann.protocol_version,
            "Ignoring announcement from future protocol version"
        );
        return None;
    }
    Some(ann)
}

/// Broadcast announce / listen loop.
///
/// Binding happens in [`DiscoveryService::bind`] so an unusable socket is a
/// startup failure, before the daemon ever reports itself running.
pub struct DiscoveryService {
    socket: UdpSocket,
    registry: Arc<AgentRegistry>,
    config: DiscoveryConfig,
    agent_id: String,
    role: AgentRole,
    dropped_datagrams: AtomicU64,
}

impl DiscoveryService {
    pub async fn bind(
        config: DiscoveryConfig,
        agent_id: String,
        role: AgentRole,
        registry: Arc<AgentRegistry>,
    ) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SkysweepError::DiscoveryBind { addr, source })?;
        socket
            .set_broadcast(true)
            .map_err(|source| SkysweepError::DiscoveryBind { addr, source })?;
        tracing::info!(addr = %addr, "Discovery listener bound");
        Ok(Self {
            socket,
            registry,
            config,
            agent_id,
            role,
            dropped_datagrams: AtomicU64::new(0),
        })
    }

    /// Run announce, listen, and expiry until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut announce = tokio::time::interval(self.config.announce_interval);
        let mut sweep = tokio::time::interval(self.config.silence_timeout / 2);
        let mut buf = [0u8; 2048];

        loop {
            tokio::select! {
                _ = announce.tick() => {
                    self.announce().await;
                }
                _ = sweep.tick() => {
                    self.registry.expire_silent(Utc::now()).await;
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                        Err(err) => {
                            tracing::warn!(error = %err, "Discovery receive error");
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::debug!("Discovery loop stopped");
    }

    async fn announce(&self) {
        let ann = Announcement {
            agent_id: self.agent_id.clone(),
            role: self.role,
            protocol_version: PROTOCOL_VERSION,
            status_port: self.config.status_port,
        };
        let payload = match serde_json::to_vec(&ann) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "Failed to encode announcement");
                return;
            }
        };
        if let Err(err) = self.socket.send_to(&payload, self.config.broadcast_addr).await {
            // transient on a flapping interface, the next tick retries
            tracing::debug!(error = %err, "Announcement send failed");
        }
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        match parse_announcement(data) {
            Some(ann) if ann.agent_id != self.agent_id => {
                self.registry.observe(ann, src, Utc::now()).await;
            }
            Some(_) => {} // our own broadcast echoed back
            None => {
                self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped_datagrams.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn ann(id: &str) -> Announcement {
        Announcement {
            agent_id: id.to_string(),
            role: AgentRole::Field,
            protocol_version: PROTOCOL_VERSION,
            status_port: 8040,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 7, 10], port))
    }

    #[tokio::test]
    async fn observe_creates_then_refreshes() {
        let registry = AgentRegistry::new(Duration::from_secs(30));
        let t0 = Utc::now();
        registry.observe(ann("van-2"), addr(1000), t0).await;
        assert_eq!(registry.len().await, 1);

        let t1 = t0 + TimeDelta::seconds(10);
        registry.observe(ann("van-2"), addr(2000), t1).await;
        let agents = registry.active().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].address, addr(2000));
        assert_eq!(agents[0].last_announced_at, t1);
    }

    #[tokio::test]
    async fn silent_agent_expires_exactly_once() {
        let registry = AgentRegistry::new(Duration::from_secs(30));
        let t0 = Utc::now();
        registry.observe(ann("van-2"), addr(1000), t0).await;

        let late = t0 + TimeDelta::seconds(31);
        assert_eq!(registry.expire_silent(late).await, vec!["van-2".to_string()]);
        // second sweep finds nothing; no resurrection without an announcement
        assert!(registry.expire_silent(late).await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn announcement_resurrects_expired_agent() {
        let registry = AgentRegistry::new(Duration::from_secs(30));
        let t0 = Utc::now();
        registry.observe(ann("van-2"), addr(1000), t0).await;
        registry.expire_silent(t0 + TimeDelta::seconds(40)).await;

        registry
            .observe(ann("van-2"), addr(1000), t0 + TimeDelta::seconds(50))
            .await;
        assert_eq!(registry.len().await, 1);
    }

    #[test]
    fn parse_rejects_future_protocol_version() {
        let mut future = ann("x");
        future.protocol_version = PROTOCOL_VERSION + 1;
        let data = serde_json::to_vec(&future).unwrap();
        assert!(parse_announcement(&data).is_none());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_announcement(b"not json").is_none());
        assert!(parse_announcement(b"{\"agent_id\":\"x\"}").is_none());
    }

    #[test]
    fn parse_accepts_current_version() {
        let data = serde_json::to_vec(&ann("van-9")).unwrap();
        let parsed = parse_announcement(&data).unwrap();
        assert_eq!(parsed.agent_id, "van-9");
        assert_eq!(parsed.role, AgentRole::Field);
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let config = DiscoveryConfig {
            listen_port: 48891,
            ..DiscoveryConfig::default()
        };
        let _first = DiscoveryService::bind(
            config.clone(),
            "a".into(),
            AgentRole::Field,
            Arc::clone(&registry),
        )
        .await
        .unwrap();

        let second = DiscoveryService::bind(config, "b".into(), AgentRole::Field, registry).await;
        assert!(matches!(
            second,
            Err(SkysweepError::DiscoveryBind { .. })
        ));
    }
}
