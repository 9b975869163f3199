//! Storeman group directory: who belongs to which group, and their keys.
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use secp256kfun::{marker::EvenY, Point, Scalar};
use tracing::info;

use crate::config::{GroupConfig, GroupEntry};
use crate::crypto::{decode_point, Provenance, SharePoint};
use crate::error::{MpcError, Result};
use crate::message::{NodeId, PeerInfo};

#[derive(Clone, Debug)]
pub struct Member {
    pub index: u16,
    pub node_id: NodeId,
    pub public_key: Point<EvenY>,
    pub public_share: Option<SharePoint>,
}

#[derive(Clone, Debug)]
pub struct GroupInfo {
    pub id: String,
    pub threshold: usize,
    pub leader_index: u16,
    /// Sorted by index.
    pub members: Vec<Member>,
    pub gpk: Option<Vec<u8>>,
}

impl GroupInfo {
    fn from_entry(entry: &GroupEntry) -> Result<Self> {
        let invalid = |reason: String| MpcError::InvalidConfig(format!("group {}: {reason}", entry.id));
        let mut members = Vec::with_capacity(entry.members.len());
        let mut indexes = HashSet::new();
        let mut node_ids = HashSet::new();
        for member in &entry.members {
            if !indexes.insert(member.index) || !node_ids.insert(member.node_id.clone()) {
                return Err(invalid(format!("duplicate member {}", member.node_id)));
            }
            let key_bytes: [u8; 32] = hex::decode(&member.public_key)?
                .try_into()
                .map_err(|_| invalid(format!("public key of {} is not 32 bytes", member.node_id)))?;
            let public_key = Point::<EvenY>::from_xonly_bytes(key_bytes)
                .ok_or_else(|| invalid(format!("public key of {} is not on the curve", member.node_id)))?;
            let public_share = match &member.public_share {
                Some(share) => Some(decode_point(&hex::decode(share)?)?),
                None => None,
            };
            members.push(Member {
                index: member.index,
                node_id: NodeId::new(member.node_id.clone()),
                public_key,
                public_share,
            });
        }
        members.sort_by_key(|member| member.index);

        if entry.threshold == 0 || entry.threshold > members.len() {
            return Err(invalid(format!(
                "threshold {} with {} members",
                entry.threshold,
                members.len()
            )));
        }
        if !indexes.contains(&entry.leader_index) {
            return Err(invalid(format!("leader index {} is not a member", entry.leader_index)));
        }
        Ok(GroupInfo {
            id: entry.id.clone(),
            threshold: entry.threshold,
            leader_index: entry.leader_index,
            members,
            gpk: None,
        })
    }

    pub fn total(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, index: u16) -> Result<&Member> {
        self.members
            .iter()
            .find(|member| member.index == index)
            .ok_or_else(|| MpcError::UnknownPeer(format!("{}#{index}", self.id)))
    }

    pub fn member_by_id(&self, node_id: &NodeId) -> Result<&Member> {
        self.members
            .iter()
            .find(|member| &member.node_id == node_id)
            .ok_or_else(|| MpcError::UnknownPeer(node_id.to_string()))
    }

    pub fn leader(&self) -> Result<&Member> {
        self.member(self.leader_index)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.node_id.clone()).collect()
    }
}

/// Node-wide, read-mostly view of the groups this node belongs to.
pub struct GroupDirectory {
    self_id: NodeId,
    self_secret: Scalar,
    provenance: Provenance,
    groups: RwLock<HashMap<String, Arc<GroupInfo>>>,
}

impl GroupDirectory {
    pub fn new(config: &GroupConfig, self_id: NodeId, self_secret: Scalar) -> Result<Self> {
        let directory = GroupDirectory {
            self_id,
            self_secret,
            provenance: Provenance::default(),
            groups: RwLock::new(HashMap::new()),
        };
        directory.refresh_from(config)?;
        Ok(directory)
    }

    pub fn load(path: impl AsRef<Path>, self_id: NodeId, self_secret: Scalar) -> Result<Self> {
        Self::new(&GroupConfig::from_file(path)?, self_id, self_secret)
    }

    /// Re-read the group file. Known GPKs and learned public shares survive the reload.
    pub fn refresh(&self, path: impl AsRef<Path>) -> Result<()> {
        self.refresh_from(&GroupConfig::from_file(path)?)
    }

    pub fn refresh_from(&self, config: &GroupConfig) -> Result<()> {
        let mut parsed = HashMap::new();
        for entry in &config.groups {
            let group = GroupInfo::from_entry(entry)?;
            if parsed.contains_key(&group.id) {
                return Err(MpcError::InvalidConfig(format!("duplicate group {}", group.id)));
            }
            parsed.insert(group.id.clone(), group);
        }

        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        for (id, group) in parsed.iter_mut() {
            if let Some(old) = groups.get(id) {
                group.gpk = old.gpk.clone();
                for member in group.members.iter_mut().filter(|m| m.public_share.is_none()) {
                    member.public_share = old
                        .members
                        .iter()
                        .find(|m| m.node_id == member.node_id)
                        .and_then(|m| m.public_share);
                }
            }
        }
        *groups = parsed.into_iter().map(|(id, g)| (id, Arc::new(g))).collect();
        info!(node = %self.self_id, groups = groups.len(), "group directory loaded");
        Ok(())
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn self_secret(&self) -> &Scalar {
        &self.self_secret
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn group(&self, group_id: &str) -> Result<Arc<GroupInfo>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_id)
            .cloned()
            .ok_or_else(|| MpcError::UnknownGroup(group_id.to_string()))
    }

    pub fn group_ids(&self) -> Vec<String> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn self_index(&self, group_id: &str) -> Result<u16> {
        self.index_of(group_id, &self.self_id)
    }

    pub fn index_of(&self, group_id: &str, node_id: &NodeId) -> Result<u16> {
        Ok(self.group(group_id)?.member_by_id(node_id)?.index)
    }

    pub fn node_id_of(&self, group_id: &str, index: u16) -> Result<NodeId> {
        Ok(self.group(group_id)?.member(index)?.node_id.clone())
    }

    pub fn public_key(&self, group_id: &str, index: u16) -> Result<Point<EvenY>> {
        Ok(self.group(group_id)?.member(index)?.public_key)
    }

    pub fn public_key_of(&self, group_id: &str, node_id: &NodeId) -> Result<Point<EvenY>> {
        Ok(self.group(group_id)?.member_by_id(node_id)?.public_key)
    }

    pub fn public_share(&self, group_id: &str, index: u16) -> Result<Option<SharePoint>> {
        Ok(self.group(group_id)?.member(index)?.public_share)
    }

    /// `true` when `node_id` belongs to any group this node knows.
    pub fn is_member(&self, node_id: &NodeId) -> bool {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|group| group.member_by_id(node_id).is_ok())
    }

    pub fn threshold(&self, group_id: &str) -> Result<usize> {
        Ok(self.group(group_id)?.threshold)
    }

    pub fn total(&self, group_id: &str) -> Result<usize> {
        Ok(self.group(group_id)?.total())
    }

    pub fn leader_index(&self, group_id: &str) -> Result<u16> {
        Ok(self.group(group_id)?.leader_index)
    }

    pub fn leader_id(&self, group_id: &str) -> Result<NodeId> {
        Ok(self.group(group_id)?.leader()?.node_id.clone())
    }

    pub fn is_leader(&self, group_id: &str) -> Result<bool> {
        Ok(self.leader_id(group_id)? == self.self_id)
    }

    /// Group member list with unassigned seeds.
    pub fn peers(&self, group_id: &str) -> Result<Vec<PeerInfo>> {
        Ok(self
            .group(group_id)?
            .members
            .iter()
            .map(|m| PeerInfo {
                node_id: m.node_id.clone(),
                seed: 0,
            })
            .collect())
    }

    pub fn set_gpk(&self, group_id: &str, gpk: &[u8]) -> Result<()> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| MpcError::UnknownGroup(group_id.to_string()))?;
        Arc::make_mut(group).gpk = Some(gpk.to_vec());
        Ok(())
    }

    /// Record the public shares a key generation run published, by member index.
    pub fn set_public_shares(&self, group_id: &str, shares: &[(u16, SharePoint)]) -> Result<()> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let group = Arc::make_mut(
            groups
                .get_mut(group_id)
                .ok_or_else(|| MpcError::UnknownGroup(group_id.to_string()))?,
        );
        for (index, share) in shares {
            let member = group
                .members
                .iter_mut()
                .find(|m| m.index == *index)
                .ok_or_else(|| MpcError::UnknownPeer(format!("index {index}")))?;
            member.public_share = Some(*share);
        }
        Ok(())
    }

    pub fn group_for_gpk(&self, gpk: &[u8]) -> Result<String> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups
            .values()
            .find(|g| g.gpk.as_deref() == Some(gpk))
            .map(|g| g.id.clone())
            .ok_or(MpcError::UnknownGpk)
    }
}

/// Seed assigned to `node_id` in a run's peer list.
pub fn x_value(peers: &[PeerInfo], node_id: &NodeId) -> Result<u64> {
    peers
        .iter()
        .find(|p| &p.node_id == node_id)
        .map(|p| p.seed)
        .ok_or_else(|| MpcError::UnknownPeer(node_id.to_string()))
}

/// Elements of `all` missing from `subset`.
pub fn difference(all: &[u16], subset: &[u16]) -> Vec<u16> {
    let subset: HashSet<_> = subset.iter().collect();
    all.iter().filter(|i| !subset.contains(i)).copied().collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::MemberConfig;
    use secp256kfun::proptest::test_runner::{RngAlgorithm, TestRng};

    pub fn test_group(n: usize, threshold: usize) -> (GroupConfig, Vec<(NodeId, Scalar)>) {
        let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
        let provenance = Provenance::default();
        let mut members = vec![];
        let mut secrets = vec![];
        for i in 0..n {
            let secret = Scalar::random(&mut rng);
            let node_id = format!("node{i}");
            members.push(MemberConfig {
                index: i as u16,
                node_id: node_id.clone(),
                public_key: hex::encode(provenance.public_key(&secret).to_xonly_bytes()),
                public_share: None,
            });
            secrets.push((NodeId::new(node_id), secret));
        }
        let config = GroupConfig {
            groups: vec![GroupEntry {
                id: "grp0".into(),
                threshold,
                leader_index: 0,
                members,
            }],
        };
        (config, secrets)
    }

    #[test]
    fn lookups_by_index_and_identity() {
        let (config, secrets) = test_group(4, 3);
        let (self_id, secret) = secrets[2].clone();
        let directory = GroupDirectory::new(&config, self_id.clone(), secret.clone()).unwrap();
        assert_eq!(directory.self_index("grp0").unwrap(), 2);
        assert_eq!(directory.node_id_of("grp0", 3).unwrap(), NodeId::new("node3"));
        assert_eq!(directory.threshold("grp0").unwrap(), 3);
        assert_eq!(directory.total("grp0").unwrap(), 4);
        assert_eq!(directory.leader_id("grp0").unwrap(), NodeId::new("node0"));
        assert!(!directory.is_leader("grp0").unwrap());
        assert_eq!(
            directory.public_key_of("grp0", &self_id).unwrap(),
            directory.provenance().public_key(&secret)
        );
        assert_eq!(
            directory.public_key("grp0", 1).unwrap(),
            directory.provenance().public_key(&secrets[1].1)
        );
        assert!(directory.is_member(&NodeId::new("node0")));
        assert!(!directory.is_member(&NodeId::new("stranger")));
        assert!(matches!(directory.group("nope"), Err(MpcError::UnknownGroup(_))));
        assert!(matches!(
            directory.node_id_of("grp0", 9),
            Err(MpcError::UnknownPeer(_))
        ));
    }

    #[test]
    fn refresh_keeps_known_gpk_and_rejects_bad_threshold() {
        let (mut config, secrets) = test_group(4, 3);
        let (self_id, secret) = secrets[0].clone();
        let directory = GroupDirectory::new(&config, self_id, secret).unwrap();
        directory.set_gpk("grp0", &[2u8; 33]).unwrap();
        directory.refresh_from(&config).unwrap();
        assert_eq!(directory.group_for_gpk(&[2u8; 33]).unwrap(), "grp0");
        assert_eq!(directory.group_for_gpk(&[3u8; 33]), Err(MpcError::UnknownGpk));

        config.groups[0].threshold = 5;
        assert!(matches!(
            directory.refresh_from(&config),
            Err(MpcError::InvalidConfig(_))
        ));
        // a failed refresh leaves the previous view in place
        assert_eq!(directory.threshold("grp0").unwrap(), 3);
    }

    #[test]
    fn difference_of_index_sets() {
        assert_eq!(difference(&[0, 1, 2, 3], &[1, 3]), vec![0, 2]);
        assert!(difference(&[0, 1], &[0, 1]).is_empty());
    }

    #[test]
    fn learned_public_shares_survive_a_refresh() {
        let (config, secrets) = test_group(4, 3);
        let (self_id, secret) = secrets[0].clone();
        let directory = GroupDirectory::new(&config, self_id, secret).unwrap();
        assert_eq!(directory.public_share("grp0", 2).unwrap(), None);

        let share = crate::crypto::public_image(&Scalar::from_bytes_mod_order([9u8; 32]));
        directory.set_public_shares("grp0", &[(2, share)]).unwrap();
        directory.refresh_from(&config).unwrap();
        assert_eq!(directory.public_share("grp0", 2).unwrap(), Some(share));
        assert!(matches!(
            directory.set_public_shares("grp0", &[(7, share)]),
            Err(MpcError::UnknownPeer(_))
        ));
    }
}
