//! # Topology Router
//!
//! Purpose: Decide which server receives a command, for single keys, key
//! sets and key-less commands, in both standalone and cluster deployments.
//!
//! ## Design Principles
//! 1. **Positional Identity**: Servers are identified by their index in an
//!    append-only node table; pools are keyed by that index.
//! 2. **Read-Mostly Slot Map**: Lookups take a shared lock; rebuilds replace
//!    the whole table under an exclusive one.
//! 3. **Lazy Rebuild**: A MOVED reply only drops the map. The next access
//!    that needs it rebuilds it from `CLUSTER SLOTS`.
//! 4. **No Guessing**: A slot without an owner is an error, never a fallback
//!    to some other node.
//!
//! ## Routing Table
//! ```text
//!              standalone                    cluster
//! Read   replica (PreferReplica) or 0    primary owning the slot
//! Write  0                               primary owning the slot
//! ```

use std::sync::Arc;

use ahash::RandomState;
use ckv_common::{
    key_slot, Access, CacheError, CacheOptions, CacheResult, ReadPolicy, ServerAddress,
    ServerDescriptor, ServerRole, TopologyError, SLOT_COUNT,
};
use hashbrown::HashMap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::resp::RespValue;

/// Where a command should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Key-less command: the primary, or a replica for reads.
    Any,
    /// Keyed command; the slot of its (first) key.
    Slot(u16),
    /// A specific entry of the node table.
    Node(usize),
}

impl Route {
    pub fn for_key(key: &str) -> Self {
        Route::Slot(key_slot(key.as_bytes()))
    }
}

/// Keys of one bulk request that share a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGroup {
    pub route: Route,
    /// Positions of the group's keys in the caller's key list.
    pub positions: Vec<usize>,
}

/// A cluster redirection reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Moved { slot: u16, host: String, port: u16 },
    Ask { slot: u16, host: String, port: u16 },
}

/// Parses `MOVED <slot> <host>:<port>` and `ASK <slot> <host>:<port>`.
pub fn parse_redirect(message: &str) -> Option<Redirect> {
    let mut parts = message.split_whitespace();
    let kind = parts.next()?;
    let slot: u16 = parts.next()?.parse().ok()?;
    let (host, port) = parts.next()?.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    match kind {
        "MOVED" => Some(Redirect::Moved { slot, host, port }),
        "ASK" => Some(Redirect::Ask { slot, host, port }),
        _ => None,
    }
}

type SlotTable = Vec<Option<usize>>;

/// Node table plus slot map.
pub struct Router {
    cluster: bool,
    read_policy: ReadPolicy,
    /// Credentials and TLS settings for nodes learned at runtime.
    template: ServerAddress,
    nodes: RwLock<Vec<ServerDescriptor>>,
    slots: RwLock<Option<Arc<SlotTable>>>,
}

impl Router {
    /// Builds the node table from the configured addresses. In standalone
    /// mode the first address is the primary and the rest are replicas; in
    /// cluster mode every address is a seed primary.
    pub fn new(options: &CacheOptions) -> CacheResult<Self> {
        let addresses = options.addresses()?;
        let Some(template) = addresses.first().cloned() else {
            return Err(CacheError::Config("no servers configured".into()));
        };
        let nodes = addresses
            .into_iter()
            .enumerate()
            .map(|(index, address)| ServerDescriptor {
                address,
                role: if index == 0 || options.cluster {
                    ServerRole::Primary
                } else {
                    ServerRole::Replica
                },
                index,
            })
            .collect();
        Ok(Router {
            cluster: options.cluster,
            read_policy: options.read_policy,
            template,
            nodes: RwLock::new(nodes),
            slots: RwLock::new(None),
        })
    }

    #[inline]
    pub fn is_cluster(&self) -> bool {
        self.cluster
    }

    /// Snapshot of the node table.
    pub fn nodes(&self) -> Vec<ServerDescriptor> {
        self.nodes.read().clone()
    }

    pub fn address(&self, index: usize) -> CacheResult<ServerAddress> {
        self.nodes
            .read()
            .get(index)
            .map(|node| node.address.clone())
            .ok_or_else(|| CacheError::Config(format!("no server with index {index}")))
    }

    /// Whether the slot map must be (re)built before slot routes resolve.
    pub fn needs_slots(&self) -> bool {
        self.cluster && self.slots.read().is_none()
    }

    /// Resolves a route to a node index.
    pub fn resolve(&self, route: Route, access: Access) -> CacheResult<usize> {
        match route {
            Route::Node(index) => Ok(index),
            Route::Any | Route::Slot(_) if !self.cluster => Ok(self.standalone_target(access)),
            Route::Any => Ok(self.primaries()?.first().copied().unwrap_or(0)),
            Route::Slot(slot) => {
                let slots = self.slots.read();
                let table = slots.as_ref().ok_or(TopologyError::UnresolvedSlot(slot))?;
                table
                    .get(slot as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| TopologyError::UnresolvedSlot(slot).into())
            }
        }
    }

    fn standalone_target(&self, access: Access) -> usize {
        if access == Access::Write || self.read_policy == ReadPolicy::Primary {
            return 0;
        }
        let nodes = self.nodes.read();
        let replicas: Vec<usize> = nodes
            .iter()
            .filter(|node| node.role == ServerRole::Replica)
            .map(|node| node.index)
            .collect();
        match replicas.len() {
            0 => 0,
            1 => replicas[0],
            n => replicas[rand::thread_rng().gen_range(0..n)],
        }
    }

    /// Every node that owns data: the primary in standalone mode, every slot
    /// owner in cluster mode.
    pub fn primaries(&self) -> CacheResult<Vec<usize>> {
        if !self.cluster {
            return Ok(vec![0]);
        }
        let slots = self.slots.read();
        let table = slots.as_ref().ok_or(TopologyError::UnresolvedSlot(0))?;
        let mut owners: Vec<usize> = table.iter().flatten().copied().collect();
        owners.sort_unstable();
        owners.dedup();
        Ok(owners)
    }

    /// Nodes to ask for the slot layout, seeds first.
    pub fn seeds(&self) -> Vec<usize> {
        self.nodes
            .read()
            .iter()
            .filter(|node| node.role == ServerRole::Primary)
            .map(|node| node.index)
            .collect()
    }

    /// Drops the slot map; the next slot lookup triggers a rebuild.
    pub fn invalidate(&self) {
        if self.slots.write().take().is_some() {
            info!("slot map invalidated");
        }
    }

    /// Index of the node at `host:port`, appending it when unknown. A known
    /// replica reported as a primary is promoted.
    pub fn node_for(&self, host: &str, port: u16, role: ServerRole) -> usize {
        let candidate = self.template.with_endpoint(host, port);
        let label = candidate.label();
        if let Some(node) = self.nodes.read().iter().find(|n| n.address.label() == label) {
            if node.role == role || role == ServerRole::Replica {
                return node.index;
            }
        }
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.iter_mut().find(|n| n.address.label() == label) {
            if role == ServerRole::Primary && node.role != ServerRole::Primary {
                debug!(index = node.index, addr = %label, "node promoted to primary");
                node.role = ServerRole::Primary;
            }
            return node.index;
        }
        let index = nodes.len();
        nodes.push(ServerDescriptor {
            address: candidate,
            role,
            index,
        });
        index
    }

    /// Rebuilds the slot map from a `CLUSTER SLOTS` reply obtained from
    /// node `source`.
    pub fn apply_slots(&self, source: usize, reply: RespValue) -> CacheResult<()> {
        let source_host = match self.address(source)?.endpoint {
            ckv_common::Endpoint::Tcp { host, .. } => host,
            ckv_common::Endpoint::Unix { .. } => String::new(),
        };
        let ranges = reply
            .into_array()
            .ok_or_else(|| CacheError::Protocol("CLUSTER SLOTS: expected array".into()))?;

        let mut table: SlotTable = vec![None; SLOT_COUNT as usize];
        for range in ranges {
            let mut fields = range
                .into_array()
                .ok_or_else(|| CacheError::Protocol("CLUSTER SLOTS: malformed range".into()))?
                .into_iter();
            let (Some(start), Some(end)) = (
                fields.next().and_then(|v| v.as_integer()),
                fields.next().and_then(|v| v.as_integer()),
            ) else {
                return Err(CacheError::Protocol("CLUSTER SLOTS: missing slot bounds".into()));
            };
            let mut primary = None;
            for (position, node) in fields.enumerate() {
                let Some((host, port)) = node_endpoint(node, &source_host) else {
                    continue;
                };
                let role = if position == 0 { ServerRole::Primary } else { ServerRole::Replica };
                let index = self.node_for(&host, port, role);
                if position == 0 {
                    primary = Some(index);
                }
            }
            let Some(primary) = primary else {
                continue;
            };
            let end = end.min(SLOT_COUNT as i64 - 1);
            if start < 0 || start > end {
                continue;
            }
            for slot in &mut table[start as usize..=end as usize] {
                *slot = Some(primary);
            }
        }

        let uncovered = table.iter().filter(|slot| slot.is_none()).count();
        if uncovered > 0 {
            warn!(uncovered, "slot map does not cover every slot");
        }
        info!(nodes = self.nodes.read().len(), "slot map rebuilt");
        *self.slots.write() = Some(Arc::new(table));
        Ok(())
    }

    /// Groups keys for a non-atomic bulk request. Standalone deployments get
    /// a single group; clusters get one group per slot, in first-seen order.
    pub fn group_keys<K: AsRef<str>>(&self, keys: &[K]) -> Vec<KeyGroup> {
        if keys.is_empty() {
            return Vec::new();
        }
        if !self.cluster {
            return vec![KeyGroup {
                route: Route::Any,
                positions: (0..keys.len()).collect(),
            }];
        }
        group_by_slot(keys)
    }
}

/// Groups key positions by hash slot, preserving first-seen order.
pub fn group_by_slot<K: AsRef<str>>(keys: &[K]) -> Vec<KeyGroup> {
    let mut index: HashMap<u16, usize, RandomState> = HashMap::with_hasher(RandomState::new());
    let mut groups: Vec<KeyGroup> = Vec::new();
    for (position, key) in keys.iter().enumerate() {
        let slot = key_slot(key.as_ref().as_bytes());
        let group = *index.entry(slot).or_insert_with(|| {
            groups.push(KeyGroup {
                route: Route::Slot(slot),
                positions: Vec::new(),
            });
            groups.len() - 1
        });
        groups[group].positions.push(position);
    }
    groups
}

fn node_endpoint(node: RespValue, fallback_host: &str) -> Option<(String, u16)> {
    let mut fields = node.into_array()?.into_iter();
    let host = fields.next()?.as_text()?;
    let port = u16::try_from(fields.next()?.as_integer()?).ok()?;
    // An empty host means "the node you asked".
    let host = if host.is_empty() { fallback_host.to_string() } else { host };
    Some((host, port))
}
