#![forbid(unsafe_code)]

// One-time fixture provisioning: signs up users and builds the room
// topology before the timed run starts. Strictly best-effort - individual
// failures are logged and skipped, never retried, and an empty fixture set
// downgrades iterations to no-ops instead of failing the run.

use crate::api::{ApiClient, SignupRequest};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomTopology {
    /// K group rooms, created by the first user, joined by everyone else.
    Group { rooms: usize },
    /// One direct room per consecutive user pair.
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Group,
    Direct,
}

#[derive(Debug, Clone)]
pub struct User {
    pub user_id: u64,
    pub token: String,
    pub email: String,
    pub nickname: String,
}

/// A provisioned room. `members` holds indices into the fixture user list;
/// group rooms accumulate members as joins succeed, direct rooms always
/// carry exactly the pair that owns them.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: u64,
    pub kind: RoomKind,
    pub members: Vec<usize>,
}

impl Room {
    pub fn direct_pair(&self) -> Option<(usize, usize)> {
        match (self.kind, self.members.as_slice()) {
            (RoomKind::Direct, &[user1, user2]) => Some((user1, user2)),
            _ => None,
        }
    }
}

/// Immutable output of provisioning, shared read-only by all workers.
#[derive(Debug, Default)]
pub struct FixtureSet {
    pub users: Vec<User>,
    pub rooms: Vec<Room>,
}

impl FixtureSet {
    pub fn is_usable(&self) -> bool {
        !self.users.is_empty() && !self.rooms.is_empty()
    }
}

/// Runs the whole provisioning pass. `nonce` disambiguates derived emails
/// across runs against the same service instance.
pub async fn provision(
    client: &ApiClient,
    user_count: usize,
    topology: RoomTopology,
    nonce: u64,
) -> FixtureSet {
    let mut users = Vec::new();
    for i in 0..user_count {
        let signup = SignupRequest {
            email: format!("loadtest-{i}-{nonce}@test.com"),
            password: "password123".to_string(),
            nickname: format!("LoadUser{i}"),
        };
        match client.signup(&signup).await {
            Ok(auth) => users.push(User {
                user_id: auth.user_id,
                token: auth.token,
                email: signup.email,
                nickname: signup.nickname,
            }),
            Err(e) => warn!("signup {i} failed, skipping: {e}"),
        }
    }
    info!("{} of {user_count} users provisioned", users.len());

    let rooms = match topology {
        RoomTopology::Group { rooms } => provision_group_rooms(client, &users, rooms).await,
        RoomTopology::Direct => provision_direct_rooms(client, &users).await,
    };

    let fixtures = FixtureSet { users, rooms };
    if !fixtures.is_usable() {
        warn!(
            "fixture set is unusable (users={}, rooms={}); iterations will no-op",
            fixtures.users.len(),
            fixtures.rooms.len()
        );
    }
    fixtures
}

async fn provision_group_rooms(client: &ApiClient, users: &[User], count: usize) -> Vec<Room> {
    let Some(creator) = users.first() else {
        return Vec::new();
    };

    let mut rooms = Vec::new();
    for k in 0..count {
        match client
            .create_group_room(&creator.token, &format!("load-room-{k}"))
            .await
        {
            Ok(room) => rooms.push(Room {
                id: room.id,
                kind: RoomKind::Group,
                members: vec![0],
            }),
            Err(e) => warn!("group room {k} creation failed, skipping: {e}"),
        }
    }
    info!("{} of {count} group rooms created", rooms.len());

    // Everyone but the creator joins every room; successes are only counted
    // for diagnostics.
    let mut joins = 0usize;
    for (u, user) in users.iter().enumerate().skip(1) {
        for room_index in 0..rooms.len() {
            let room_id = rooms[room_index].id;
            match client.join_room(&user.token, room_id).await {
                Ok(()) => {
                    rooms[room_index].members.push(u);
                    joins += 1;
                }
                Err(e) => warn!("user {u} failed to join room {room_id}, skipping: {e}"),
            }
        }
    }
    info!("{joins} room joins completed across {} rooms", rooms.len());
    rooms
}

async fn provision_direct_rooms(client: &ApiClient, users: &[User]) -> Vec<Room> {
    let mut rooms = Vec::new();
    let mut i = 0;
    while i + 1 < users.len() {
        let (user1, user2) = (i, i + 1);
        match client
            .create_direct_room(&users[user1].token, users[user2].user_id)
            .await
        {
            Ok(room) => rooms.push(Room {
                id: room.id,
                kind: RoomKind::Direct,
                members: vec![user1, user2],
            }),
            Err(e) => warn!("direct room for pair ({user1},{user2}) failed, skipping: {e}"),
        }
        i += 2;
    }
    info!("{} direct rooms created", rooms.len());
    rooms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Registry;
    use crate::testutil::StubChatServer;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_direct_topology_pairs_consecutive_users() {
        let server = StubChatServer::spawn(0).await;
        let client = ApiClient::new(server.base_url.as_str(), Arc::new(Registry::new()));

        let fixtures = provision(&client, 6, RoomTopology::Direct, 1).await;
        assert_eq!(fixtures.users.len(), 6);
        assert_eq!(fixtures.rooms.len(), 3);
        for (n, room) in fixtures.rooms.iter().enumerate() {
            assert_eq!(room.kind, RoomKind::Direct);
            assert_eq!(room.direct_pair(), Some((2 * n, 2 * n + 1)));
        }
        assert!(fixtures.is_usable());
    }

    #[tokio::test]
    async fn test_partial_signup_failure_is_tolerated() {
        // Every 4th signup fails: 8 requested -> 6 provisioned -> 3 pairs.
        let server = StubChatServer::spawn(4).await;
        let client = ApiClient::new(server.base_url.as_str(), Arc::new(Registry::new()));

        let fixtures = provision(&client, 8, RoomTopology::Direct, 2).await;
        assert_eq!(fixtures.users.len(), 6);
        assert_eq!(fixtures.rooms.len(), 3);
    }

    #[tokio::test]
    async fn test_group_topology_joins_all_users() {
        let server = StubChatServer::spawn(0).await;
        let client = ApiClient::new(server.base_url.as_str(), Arc::new(Registry::new()));

        let fixtures = provision(&client, 4, RoomTopology::Group { rooms: 2 }, 3).await;
        assert_eq!(fixtures.users.len(), 4);
        assert_eq!(fixtures.rooms.len(), 2);
        for room in &fixtures.rooms {
            assert_eq!(room.kind, RoomKind::Group);
            // Creator plus the three joiners.
            assert_eq!(room.members, vec![0, 1, 2, 3]);
            assert_eq!(room.direct_pair(), None);
        }
    }

    #[tokio::test]
    async fn test_zero_users_yields_unusable_fixture_set() {
        let server = StubChatServer::spawn(0).await;
        let client = ApiClient::new(server.base_url.as_str(), Arc::new(Registry::new()));

        let fixtures = provision(&client, 0, RoomTopology::Group { rooms: 5 }, 4).await;
        assert!(fixtures.users.is_empty());
        assert!(fixtures.rooms.is_empty());
        assert!(!fixtures.is_usable());
    }

}
