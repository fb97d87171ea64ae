//! Consistent hash ring
//!
//! TigerStyle: Deterministic ownership with bounded remapping.
//!
//! Each member contributes a fixed number of virtual points placed on a
//! modular u64 ring by hashing `"{address}-{i}"`. An identity is owned by
//! the member holding the next point clockwise from the identity's hash.
//! Adding or removing one member only remaps the key ranges adjacent to
//! that member's points; every other key keeps its owner.
//!
//! Incremental `add_member`/`remove_member` are observationally identical
//! to rebuilding the ring from the resulting member list: point positions
//! depend only on the member's address and the point index.

use crate::error::TopologyError;
use rapidhash::RapidHasher;
use selkie_core::{
    ClusterIdentity, Member, MemberId, CLUSTER_MEMBERS_COUNT_MAX, RING_VIRTUAL_POINTS_COUNT_MAX,
};
use std::collections::BTreeMap;
use std::hash::Hasher;

/// Fixed seed so point placement is stable across processes
const RING_HASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Hash arbitrary bytes onto the ring
fn ring_hash(bytes: &[u8]) -> u64 {
    let mut hasher = RapidHasher::new(RING_HASH_SEED);
    hasher.write(bytes);
    hasher.finish()
}

/// Consistent hash ring over the current member set
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual points contributed per member
    virtual_points: usize,
    /// Members currently on the ring, by id
    members: BTreeMap<MemberId, Member>,
    /// Sorted (point hash, owning member) pairs
    points: Vec<(u64, MemberId)>,
}

impl HashRing {
    /// Create an empty ring
    ///
    /// # Panics
    /// Panics if `virtual_points` is zero or exceeds the limit.
    pub fn new(virtual_points: usize) -> Self {
        assert!(virtual_points >= 1, "ring needs at least one virtual point");
        assert!(
            virtual_points <= RING_VIRTUAL_POINTS_COUNT_MAX,
            "virtual point count {} exceeds limit {}",
            virtual_points,
            RING_VIRTUAL_POINTS_COUNT_MAX
        );

        Self {
            virtual_points,
            members: BTreeMap::new(),
            points: Vec::new(),
        }
    }

    /// Build a ring from a member list
    pub fn from_members(
        members: impl IntoIterator<Item = Member>,
        virtual_points: usize,
    ) -> Result<Self, TopologyError> {
        let mut ring = Self::new(virtual_points);
        for member in members {
            ring.add_member(member)?;
        }
        Ok(ring)
    }

    /// Number of members on the ring
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check whether the ring has no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check whether the ring contains the given member
    pub fn contains(&self, member_id: &MemberId) -> bool {
        self.members.contains_key(member_id)
    }

    /// Iterate the members currently on the ring (ordered by id)
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Add a member's virtual points to the ring
    ///
    /// Adding an already-present member is a no-op.
    pub fn add_member(&mut self, member: Member) -> Result<(), TopologyError> {
        if self.members.contains_key(&member.id) {
            return Ok(());
        }

        if self.members.len() >= CLUSTER_MEMBERS_COUNT_MAX {
            return Err(TopologyError::TooManyMembers {
                count: self.members.len() + 1,
                limit: CLUSTER_MEMBERS_COUNT_MAX,
            });
        }

        self.points.reserve(self.virtual_points);
        for point in Self::points_for(&member, self.virtual_points) {
            self.points.push(point);
        }
        // Ties broken by member id so ordering never depends on insertion order
        self.points.sort_unstable();

        self.members.insert(member.id.clone(), member);

        debug_assert_eq!(self.points.len(), self.members.len() * self.virtual_points);
        Ok(())
    }

    /// Remove a member and its virtual points from the ring
    ///
    /// Removing an absent member is a no-op.
    pub fn remove_member(&mut self, member_id: &MemberId) {
        if self.members.remove(member_id).is_none() {
            return;
        }

        self.points.retain(|(_, owner)| owner != member_id);
        debug_assert_eq!(self.points.len(), self.members.len() * self.virtual_points);
    }

    /// Find the member owning the given identity
    ///
    /// Returns `None` on an empty ring.
    pub fn owner(&self, identity: &ClusterIdentity) -> Option<&Member> {
        self.owner_of_key(&identity.qualified_name())
    }

    /// Find the member owning an arbitrary key string
    pub fn owner_of_key(&self, key: &str) -> Option<&Member> {
        if self.points.is_empty() {
            return None;
        }

        let hash = ring_hash(key.as_bytes());

        // Next point clockwise: first point with hash >= key, wrapping to
        // the start of the sorted list.
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let (_, member_id) = if idx == self.points.len() {
            &self.points[0]
        } else {
            &self.points[idx]
        };

        let member = self.members.get(member_id);
        debug_assert!(member.is_some(), "ring point references unknown member");
        member
    }

    /// Virtual points for one member
    fn points_for(member: &Member, virtual_points: usize) -> impl Iterator<Item = (u64, MemberId)> + '_ {
        let address = member.address();
        (0..virtual_points).map(move |i| {
            let key = format!("{}-{}", address, i);
            (ring_hash(key.as_bytes()), member.id.clone())
        })
    }
}
