//! Connectivity status reporting and the rediscovery trigger.
//!
//! Every connection publishes a [`ConnectionStatus`] through its operator
//! context when it connects or disconnects. The host batches those per
//! operator and hands them to a [`ConnectionStatusListener`], which asks a
//! [`Discovery`] collaborator for upstream addresses when an instance has
//! lost its connection, or periodically otherwise.

use super::config::Address;
use super::error::Result;
use serde::{Deserialize, Serialize};
use sluice_api::stats::{BatchedOperatorStats, Response, StatsListener};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use tracing::{debug, info, warn};

/// Point-in-time connectivity of one upstream endpoint.
///
/// Equality and hashing only look at host and port, so successive statuses
/// of the same endpoint deduplicate regardless of `connected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub host: String,
    pub port: u16,
    pub connected: bool,
}

impl ConnectionStatus {
    pub fn new(address: &Address, connected: bool) -> Self {
        Self {
            host: address.host().to_string(),
            port: address.port(),
            connected,
        }
    }

    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }
}

impl PartialEq for ConnectionStatus {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for ConnectionStatus {}

impl Hash for ConnectionStatus {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

/// Locates upstream endpoints.
pub trait Discovery: Send {
    fn discover(&mut self) -> Result<Vec<Address>>;
}

/// Discovery over a fixed, externally maintained address list.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    addresses: Vec<Address>,
}

impl StaticDiscovery {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }

    pub fn set_addresses(&mut self, addresses: Vec<Address>) {
        self.addresses = addresses;
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&mut self) -> Result<Vec<Address>> {
        Ok(self.addresses.clone())
    }
}

/// Configuration for [`ConnectionStatusListener`].
#[derive(Debug, Clone)]
pub struct StatusListenerConfig {
    /// Rediscover at least once every this many reporting cycles.
    pub rediscover_every: u32,
}

impl Default for StatusListenerConfig {
    fn default() -> Self {
        Self {
            rediscover_every: 5,
        }
    }
}

/// Tracks the latest status per operator and triggers rediscovery.
pub struct ConnectionStatusListener<D> {
    discovery: D,
    config: StatusListenerConfig,
    statuses: HashMap<u32, ConnectionStatus>,
    known: HashSet<Address>,
    cycles: u32,
}

impl<D: Discovery> ConnectionStatusListener<D> {
    pub fn new(discovery: D) -> Self {
        Self::with_config(discovery, StatusListenerConfig::default())
    }

    pub fn with_config(discovery: D, config: StatusListenerConfig) -> Self {
        Self {
            discovery,
            config,
            statuses: HashMap::new(),
            known: HashSet::new(),
            cycles: 0,
        }
    }

    /// Latest status seen for `operator_id`.
    pub fn status(&self, operator_id: u32) -> Option<&ConnectionStatus> {
        self.statuses.get(&operator_id)
    }

    /// Mark addresses as already served so discovery does not report them.
    ///
    /// Discovered addresses are reported again on every rediscovery until
    /// they are added here, typically right after adopting them.
    pub fn add_known(&mut self, addresses: impl IntoIterator<Item = Address>) {
        self.known.extend(addresses);
    }

    pub fn discovery_mut(&mut self) -> &mut D {
        &mut self.discovery
    }

    fn rediscover(&mut self) -> Response<Address> {
        let addresses = match self.discovery.discover() {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(error = %e, "address discovery failed");
                return Response::default();
            }
        };

        let mut seen = HashSet::new();
        let discovered: Vec<Address> = addresses
            .into_iter()
            .filter(|a| !self.known.contains(a) && seen.insert(a.clone()))
            .collect();
        if !discovered.is_empty() {
            info!(count = discovered.len(), "discovered new upstream addresses");
        }

        Response {
            repartition_required: !discovered.is_empty(),
            discovered,
        }
    }
}

impl<D: Discovery> StatsListener<ConnectionStatus> for ConnectionStatusListener<D> {
    type Discovered = Address;

    fn process_stats(&mut self, stats: &BatchedOperatorStats<ConnectionStatus>) -> Response<Address> {
        if let Some(latest) = stats.latest_custom_stats() {
            self.known.insert(latest.address());
            self.statuses.insert(stats.operator_id, latest.clone());
        }

        let connected = self
            .statuses
            .get(&stats.operator_id)
            .is_some_and(|s| s.connected);

        self.cycles += 1;
        if connected && self.cycles < self.config.rediscover_every {
            return Response::default();
        }

        debug!(
            operator = stats.operator_id,
            connected,
            cycles = self.cycles,
            "triggering address rediscovery"
        );
        self.cycles = 0;
        self.rediscover()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_api::stats::OperatorStats;

    fn batch(operator_id: u32, statuses: Vec<Option<ConnectionStatus>>) -> BatchedOperatorStats<ConnectionStatus> {
        BatchedOperatorStats::new(
            operator_id,
            statuses
                .into_iter()
                .enumerate()
                .map(|(i, custom_stats)| OperatorStats {
                    window_id: i as u64 + 1,
                    custom_stats,
                })
                .collect(),
        )
    }

    struct CountingDiscovery {
        calls: u32,
        addresses: Vec<Address>,
    }

    impl Discovery for CountingDiscovery {
        fn discover(&mut self) -> Result<Vec<Address>> {
            self.calls += 1;
            Ok(self.addresses.clone())
        }
    }

    #[test]
    fn test_status_equality_ignores_connectivity() {
        let a = Address::new("sink-1", 8080);
        let up = ConnectionStatus::new(&a, true);
        let down = ConnectionStatus::new(&a, false);
        assert_eq!(up, down);

        let mut history = HashSet::new();
        history.insert(up);
        assert!(!history.insert(down));
        assert_ne!(
            ConnectionStatus::new(&a, true),
            ConnectionStatus::new(&Address::new("sink-1", 8081), true)
        );
    }

    #[test]
    fn test_disconnected_instance_triggers_discovery() {
        let a = Address::new("sink-1", 8080);
        let b = Address::new("sink-2", 8080);
        let mut listener = ConnectionStatusListener::new(CountingDiscovery {
            calls: 0,
            addresses: vec![a.clone(), b.clone()],
        });

        let response = listener.process_stats(&batch(
            1,
            vec![Some(ConnectionStatus::new(&a, true)), Some(ConnectionStatus::new(&a, false))],
        ));

        assert_eq!(listener.discovery.calls, 1);
        assert!(response.repartition_required);
        assert_eq!(response.discovered, vec![b]);
        assert!(!listener.status(1).unwrap().connected);
    }

    #[test]
    fn test_connected_instance_rediscovers_periodically() {
        let a = Address::new("sink-1", 8080);
        let mut listener = ConnectionStatusListener::with_config(
            CountingDiscovery {
                calls: 0,
                addresses: vec![a.clone()],
            },
            StatusListenerConfig { rediscover_every: 3 },
        );

        listener.process_stats(&batch(1, vec![Some(ConnectionStatus::new(&a, true))]));
        listener.process_stats(&batch(1, vec![None]));
        assert_eq!(listener.discovery.calls, 0);

        let response = listener.process_stats(&batch(1, vec![]));
        assert_eq!(listener.discovery.calls, 1);
        // the only discovered address is already served
        assert_eq!(response, Response::default());

        for _ in 0..3 {
            listener.process_stats(&batch(1, vec![]));
        }
        assert_eq!(listener.discovery.calls, 2);
    }

    #[test]
    fn test_unknown_instance_counts_as_disconnected() {
        let mut listener = ConnectionStatusListener::new(StaticDiscovery::new(vec![Address::new("x", 1)]));
        let response = listener.process_stats(&batch(4, vec![None]));
        assert!(response.repartition_required);

        // still unserved, so reported again
        let response = listener.process_stats(&batch(4, vec![None]));
        assert!(response.repartition_required);
        assert_eq!(response.discovered, vec![Address::new("x", 1)]);

        listener.add_known(response.discovered);
        let response = listener.process_stats(&batch(4, vec![None]));
        assert!(!response.repartition_required);
    }

    #[test]
    fn test_duplicate_discoveries_reported_once() {
        let x = Address::new("x", 1);
        let mut listener = ConnectionStatusListener::new(StaticDiscovery::new(vec![x.clone(), x.clone()]));
        let response = listener.process_stats(&batch(4, vec![None]));
        assert_eq!(response.discovered, vec![x]);
    }
}
