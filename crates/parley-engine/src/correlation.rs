//! Correlation registry.
//!
//! Maps the ids an agent assigns (conversation, deferred work) back to the
//! caller's `(operation, agent)` pair. All three indexes live behind one
//! lock, so a lookup racing a `register` sees either the old or the fully
//! updated entry. Entries never expire; the owner removes them.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use parley_core::{AgentId, ConversationId, OperationId, WorkId};

/// The caller-side identity of one operation against one agent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationKey {
    /// Caller-generated operation.
    pub operation_id: OperationId,
    /// Agent the operation was sent to.
    pub agent_id: AgentId,
}

impl CorrelationKey {
    /// Key for one pair.
    pub fn new(operation_id: OperationId, agent_id: AgentId) -> Self {
        Self {
            operation_id,
            agent_id,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.operation_id, self.agent_id)
    }
}

/// Remote ids currently known for a pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorrelationIds {
    /// Agent-assigned conversation id.
    pub conversation_id: Option<ConversationId>,
    /// Agent-assigned deferred-work id.
    pub work_id: Option<WorkId>,
}

#[derive(Default)]
struct Indexes {
    by_conversation: HashMap<ConversationId, CorrelationKey>,
    by_work: HashMap<WorkId, CorrelationKey>,
    by_pair: HashMap<CorrelationKey, CorrelationIds>,
}

impl Indexes {
    /// Detach `id` from whichever pair owns it, returning that pair.
    fn unlink_conversation(&mut self, id: &ConversationId) -> Option<CorrelationKey> {
        let owner = self.by_conversation.remove(id)?;
        if let Some(ids) = self.by_pair.get_mut(&owner) {
            ids.conversation_id = None;
        }
        Some(owner)
    }

    fn unlink_work(&mut self, id: &WorkId) -> Option<CorrelationKey> {
        let owner = self.by_work.remove(id)?;
        if let Some(ids) = self.by_pair.get_mut(&owner) {
            ids.work_id = None;
        }
        Some(owner)
    }

    fn prune(&mut self, key: &CorrelationKey) {
        if self
            .by_pair
            .get(key)
            .is_some_and(|ids| ids.conversation_id.is_none() && ids.work_id.is_none())
        {
            let _ = self.by_pair.remove(key);
        }
    }
}

/// Process-wide (but injectable) correlation state.
#[derive(Default)]
pub struct CorrelationRegistry {
    inner: RwLock<Indexes>,
}

impl CorrelationRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ids an agent has disclosed for a pair.
    ///
    /// Idempotent. A new id for the same pair replaces the previous one; an
    /// id already owned by another pair moves to this one. Calling with
    /// neither id is a no-op.
    pub fn register(
        &self,
        operation_id: &OperationId,
        agent_id: &AgentId,
        conversation_id: Option<&ConversationId>,
        work_id: Option<&WorkId>,
    ) {
        if conversation_id.is_none() && work_id.is_none() {
            return;
        }
        let key = CorrelationKey::new(operation_id.clone(), agent_id.clone());
        let mut idx = self.inner.write();
        let mut displaced = Vec::new();

        if let Some(conv) = conversation_id {
            if idx.by_conversation.get(conv) != Some(&key) {
                let previous = idx.by_pair.get(&key).and_then(|ids| ids.conversation_id.clone());
                if let Some(previous) = previous {
                    let _ = idx.by_conversation.remove(&previous);
                }
                displaced.extend(idx.unlink_conversation(conv));
                let _ = idx.by_conversation.insert(conv.clone(), key.clone());
            }
        }
        if let Some(work) = work_id {
            if idx.by_work.get(work) != Some(&key) {
                let previous = idx.by_pair.get(&key).and_then(|ids| ids.work_id.clone());
                if let Some(previous) = previous {
                    let _ = idx.by_work.remove(&previous);
                }
                displaced.extend(idx.unlink_work(work));
                let _ = idx.by_work.insert(work.clone(), key.clone());
            }
        }

        let entry = idx.by_pair.entry(key.clone()).or_default();
        if let Some(conv) = conversation_id {
            entry.conversation_id = Some(conv.clone());
        }
        if let Some(work) = work_id {
            entry.work_id = Some(work.clone());
        }

        // Pairs that lost their only id to this registration are dropped.
        for owner in displaced.iter().filter(|owner| **owner != key) {
            idx.prune(owner);
        }
    }

    /// Pair that owns a conversation id.
    pub fn lookup_by_conversation(&self, conversation_id: &ConversationId) -> Option<CorrelationKey> {
        self.inner.read().by_conversation.get(conversation_id).cloned()
    }

    /// Pair that owns a deferred-work id.
    pub fn lookup_by_work(&self, work_id: &WorkId) -> Option<CorrelationKey> {
        self.inner.read().by_work.get(work_id).cloned()
    }

    /// Ids currently registered for a pair.
    pub fn entry(&self, operation_id: &OperationId, agent_id: &AgentId) -> Option<CorrelationIds> {
        let key = CorrelationKey::new(operation_id.clone(), agent_id.clone());
        self.inner.read().by_pair.get(&key).cloned()
    }

    /// Delete every index entry for a pair. Returns whether anything was removed.
    pub fn remove(&self, operation_id: &OperationId, agent_id: &AgentId) -> bool {
        let key = CorrelationKey::new(operation_id.clone(), agent_id.clone());
        let mut idx = self.inner.write();
        let Some(ids) = idx.by_pair.remove(&key) else {
            return false;
        };
        if let Some(conv) = ids.conversation_id {
            let _ = idx.by_conversation.remove(&conv);
        }
        if let Some(work) = ids.work_id {
            let _ = idx.by_work.remove(&work);
        }
        true
    }

    /// Number of registered pairs.
    pub fn len(&self) -> usize {
        self.inner.read().by_pair.len()
    }

    /// Whether no pair is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
