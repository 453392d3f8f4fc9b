//! Presence membership tracking.
//!
//! The member set only changes through explicit snapshot, add and remove
//! frames. It is empty until the first snapshot arrives.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{MemberData, PresenceData, member_id};

/// A member of a presence channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    /// Application-defined metadata, `Null` when the server sent none
    pub info: Value,
}

impl Member {
    pub fn new(id: impl Into<String>, info: Value) -> Self {
        Self {
            id: id.into(),
            info,
        }
    }
}

impl From<MemberData> for Member {
    fn from(data: MemberData) -> Self {
        Self {
            id: member_id(&data.user_id),
            info: data.user_info.unwrap_or(Value::Null),
        }
    }
}

/// Live member set of one presence channel
#[derive(Debug, Clone, Default)]
pub struct Members {
    members: HashMap<String, Value>,
    my_id: Option<String>,
}

impl Members {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set with the members of a `subscription_succeeded`
    /// frame, returning the new snapshot
    pub(crate) fn apply_snapshot(&mut self, data: PresenceData) -> Vec<Member> {
        let PresenceData { presence } = data;
        let mut hash = presence.hash;

        let mut members: Vec<Member> = presence
            .ids
            .iter()
            .map(|id| {
                let id = member_id(id);
                let info = hash.remove(&id).unwrap_or(Value::Null);
                Member::new(id, info)
            })
            .collect();

        // Some servers send only the hash.
        members.extend(hash.into_iter().map(|(id, info)| Member::new(id, info)));

        self.replace(members)
    }

    /// Replace the whole set, returning the new snapshot
    pub fn replace<I: IntoIterator<Item = Member>>(&mut self, members: I) -> Vec<Member> {
        self.members = members.into_iter().map(|m| (m.id, m.info)).collect();
        self.to_vec()
    }

    /// Insert or overwrite a member
    pub fn add(&mut self, member: Member) {
        self.members.insert(member.id, member.info);
    }

    /// Remove a member, `None` if it was not present
    pub fn remove(&mut self, id: &str) -> Option<Member> {
        self.members
            .remove_entry(id)
            .map(|(id, info)| Member { id, info })
    }

    pub fn get(&self, id: &str) -> Option<Member> {
        self.members.get(id).map(|info| Member::new(id, info.clone()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All members ordered by id
    pub fn to_vec(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .iter()
            .map(|(id, info)| Member::new(id.clone(), info.clone()))
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    pub(crate) fn set_my_id(&mut self, id: Option<String>) {
        self.my_id = id;
    }

    /// The local member, once the snapshot containing it has arrived
    pub fn me(&self) -> Option<Member> {
        self.my_id.as_deref().and_then(|id| self.get(id))
    }
}
