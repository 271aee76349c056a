//! Client registry and room membership
//!
//! One owned table behind a single lock, created at hub start: identity →
//! endpoint, room, per-sender target set, and heartbeat. Room membership is
//! derived state and is updated in the same critical section as the `room`
//! field so the two can never disagree.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::constants::AUDIO_PORT;

/// Derive a room's multicast group inside 239.0.0.0/24.
///
/// The digest is reduced modulo 255 and shifted by one so the host octet
/// stays in 1..=255.
pub fn room_multicast_addr(room: &str) -> Ipv4Addr {
    let digest = Md5::digest(room.as_bytes());
    // 256 ≡ 1 (mod 255), so the big integer mod 255 is the byte sum mod 255.
    let h = digest.iter().fold(0u32, |acc, &b| (acc + b as u32) % 255) as u8 + 1;
    Ipv4Addr::new(239, 0, 0, h)
}

/// One registered client
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub ip: IpAddr,
    pub audio_port: u16,
    pub room: Option<String>,
    pub targets: HashSet<String>,
    pub last_heartbeat: Instant,
}

impl ClientEntry {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.audio_port)
    }
}

/// Outcome of a REGISTER attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    Taken,
    BadSecret,
}

/// Where a sender's audio should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Explicit target set: unicast to each, sender excluded
    Targets(Vec<SocketAddr>),
    /// No targets, but in a room: deliver to the members (sender excluded)
    /// or to the derived group, per hub config
    Room {
        members: Vec<SocketAddr>,
        group: SocketAddr,
    },
    /// Registered but neither targets nor room
    Nowhere,
}

/// Routing snapshot for one inbound packet
#[derive(Debug, Clone)]
pub struct SenderRoute {
    pub expected_ip: IpAddr,
    pub route: Route,
}

/// The hub's client table
pub struct Registry {
    clients: HashMap<String, ClientEntry>,
    rooms: HashMap<String, HashSet<String>>,
    secret: Option<String>,
}

impl Registry {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            secret,
        }
    }

    /// Claim an identity for an endpoint. An identity maps to at most one
    /// endpoint; re-registration of a live identity is refused.
    pub fn register(
        &mut self,
        id: &str,
        ip: IpAddr,
        audio_port: u16,
        secret: Option<&str>,
    ) -> RegisterOutcome {
        if let Some(expected) = &self.secret {
            if secret != Some(expected.as_str()) {
                return RegisterOutcome::BadSecret;
            }
        }
        if self.clients.contains_key(id) {
            return RegisterOutcome::Taken;
        }
        self.clients.insert(
            id.to_string(),
            ClientEntry {
                ip,
                audio_port,
                room: None,
                targets: HashSet::new(),
                last_heartbeat: Instant::now(),
            },
        );
        RegisterOutcome::Registered
    }

    /// Move a client into a room, leaving any previous one. Returns the
    /// room's multicast group, or None for an unknown client.
    pub fn join(&mut self, id: &str, room: &str) -> Option<Ipv4Addr> {
        if !self.clients.contains_key(id) {
            return None;
        }
        self.remove_from_room(id);
        let entry = self.clients.get_mut(id)?;
        entry.room = Some(room.to_string());
        entry.last_heartbeat = Instant::now();
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.to_string());
        Some(room_multicast_addr(room))
    }

    fn remove_from_room(&mut self, id: &str) {
        let Some(entry) = self.clients.get_mut(id) else {
            return;
        };
        if let Some(old_room) = entry.room.take() {
            if let Some(members) = self.rooms.get_mut(&old_room) {
                members.remove(id);
                if members.is_empty() {
                    self.rooms.remove(&old_room);
                }
            }
        }
    }

    /// Replace the per-sender target set. False for unknown clients.
    pub fn set_targets(&mut self, id: &str, targets: &[String]) -> bool {
        match self.clients.get_mut(id) {
            Some(entry) => {
                entry.targets = targets.iter().cloned().collect();
                entry.targets.remove(id);
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Refresh a heartbeat. False for unknown clients.
    pub fn ping(&mut self, id: &str) -> bool {
        match self.clients.get_mut(id) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop a client and its room membership.
    pub fn unregister(&mut self, id: &str) {
        self.remove_from_room(id);
        self.clients.remove(id);
    }

    /// Sorted identities
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove clients whose heartbeat is older than `timeout`; returns the
    /// reaped identities.
    pub fn reap(&mut self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heartbeat) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.unregister(id);
        }
        stale
    }

    /// Routing snapshot for a packet from `sender_id`, refreshing its
    /// heartbeat (an actively-talking client is never idle).
    pub fn route_for(&mut self, sender_id: &str) -> Option<SenderRoute> {
        let (expected_ip, targets, room) = {
            let entry = self.clients.get_mut(sender_id)?;
            entry.last_heartbeat = Instant::now();
            (entry.ip, entry.targets.clone(), entry.room.clone())
        };

        let route = if !targets.is_empty() {
            let destinations = targets
                .iter()
                .filter(|t| t.as_str() != sender_id)
                .filter_map(|t| self.clients.get(t))
                .map(ClientEntry::endpoint)
                .collect();
            Route::Targets(destinations)
        } else if let Some(room) = room {
            let members = self
                .rooms
                .get(&room)
                .map(|ids| {
                    ids.iter()
                        .filter(|m| m.as_str() != sender_id)
                        .filter_map(|m| self.clients.get(m))
                        .map(ClientEntry::endpoint)
                        .collect()
                })
                .unwrap_or_default();
            Route::Room {
                members,
                group: SocketAddr::new(IpAddr::V4(room_multicast_addr(&room)), AUDIO_PORT),
            }
        } else {
            Route::Nowhere
        };

        Some(SenderRoute { expected_ip, route })
    }

    pub fn get(&self, id: &str) -> Option<&ClientEntry> {
        self.clients.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn room_members(&self, room: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|ids| {
                let mut v: Vec<String> = ids.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }
}

/// Shared handle to the registry
pub type SharedRegistry = Arc<Mutex<Registry>>;

pub fn create_shared_registry(secret: Option<String>) -> SharedRegistry {
    Arc::new(Mutex::new(Registry::new(secret)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_register_then_takeover_refused() {
        let mut reg = Registry::new(None);
        assert_eq!(
            reg.register("1", ip(1), 40001, None),
            RegisterOutcome::Registered
        );
        assert_eq!(
            reg.register("1", ip(2), 40002, None),
            RegisterOutcome::Taken
        );
        // Registry still maps the identity to the first endpoint.
        let entry = reg.get("1").unwrap();
        assert_eq!(entry.ip, ip(1));
        assert_eq!(entry.audio_port, 40001);
    }

    #[test]
    fn test_secret_enforced_when_configured() {
        let mut reg = Registry::new(Some("pw".into()));
        assert_eq!(
            reg.register("1", ip(1), 40001, None),
            RegisterOutcome::BadSecret
        );
        assert_eq!(
            reg.register("1", ip(1), 40001, Some("wrong")),
            RegisterOutcome::BadSecret
        );
        assert_eq!(
            reg.register("1", ip(1), 40001, Some("pw")),
            RegisterOutcome::Registered
        );
    }

    #[test]
    fn test_join_moves_between_rooms() {
        let mut reg = Registry::new(None);
        reg.register("1", ip(1), 40001, None);
        reg.register("2", ip(2), 40002, None);

        reg.join("1", "main").unwrap();
        reg.join("2", "main").unwrap();
        assert_eq!(reg.room_members("main"), vec!["1", "2"]);

        reg.join("1", "side").unwrap();
        assert_eq!(reg.room_members("main"), vec!["2"]);
        assert_eq!(reg.room_members("side"), vec!["1"]);
    }

    #[test]
    fn test_join_unknown_client_refused() {
        let mut reg = Registry::new(None);
        assert!(reg.join("ghost", "main").is_none());
    }

    #[test]
    fn test_targets_route_excludes_sender() {
        let mut reg = Registry::new(None);
        for (id, last, port) in [("a", 1, 40001), ("b", 2, 40002), ("c", 3, 40003)] {
            reg.register(id, ip(last), port, None);
            reg.join(id, "main");
        }
        reg.set_targets("a", &["b".into(), "c".into(), "a".into()]);

        let route = reg.route_for("a").unwrap();
        assert_eq!(route.expected_ip, ip(1));
        match route.route {
            Route::Targets(mut dests) => {
                dests.sort();
                assert_eq!(
                    dests,
                    vec![
                        SocketAddr::new(ip(2), 40002),
                        SocketAddr::new(ip(3), 40003)
                    ]
                );
            }
            other => panic!("expected Targets, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_targets_routes_to_room() {
        let mut reg = Registry::new(None);
        reg.register("a", ip(1), 40001, None);
        reg.register("b", ip(2), 40002, None);
        reg.join("a", "main");
        reg.join("b", "main");

        let route = reg.route_for("a").unwrap();
        match route.route {
            Route::Room { members, group } => {
                assert_eq!(members, vec![SocketAddr::new(ip(2), 40002)]);
                assert_eq!(group.port(), AUDIO_PORT);
                assert_eq!(group.ip(), IpAddr::V4(room_multicast_addr("main")));
            }
            other => panic!("expected Room, got {other:?}"),
        }
    }

    #[test]
    fn test_route_unknown_sender() {
        let mut reg = Registry::new(None);
        assert!(reg.route_for("nobody").is_none());
    }

    #[test]
    fn test_reap_removes_stale() {
        let mut reg = Registry::new(None);
        reg.register("1", ip(1), 40001, None);
        reg.join("1", "main");

        assert!(reg.reap(Duration::from_secs(30)).is_empty());
        // A zero timeout makes everyone stale.
        let reaped = reg.reap(Duration::ZERO);
        assert_eq!(reaped, vec!["1"]);
        assert!(reg.is_empty());
        assert!(reg.room_members("main").is_empty());
    }

    #[test]
    fn test_list_sorted() {
        let mut reg = Registry::new(None);
        for id in ["3", "1", "2"] {
            reg.register(id, ip(1), 40001, None);
        }
        assert_eq!(reg.list(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_multicast_derivation_stable_and_in_range() {
        let a = room_multicast_addr("main");
        assert_eq!(a, room_multicast_addr("main"));
        for room in ["main", "side", "x", ""] {
            let addr = room_multicast_addr(room);
            let octets = addr.octets();
            assert_eq!(&octets[..3], &[239, 0, 0]);
            assert!(octets[3] >= 1);
        }
        assert_ne!(room_multicast_addr("main"), room_multicast_addr("side"));
    }
}
