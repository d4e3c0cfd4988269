use std::collections::{BTreeSet, HashMap};

use crate::constants::{LOCAL_ID_DYNAMIC_FIRST, LOCAL_ID_SELF_FIRST, LOCAL_ID_SELF_LAST};
use crate::types::{EntityUid, LocalId};

pub fn is_reserved(local: LocalId) -> bool {
    (LOCAL_ID_SELF_FIRST..=LOCAL_ID_SELF_LAST).contains(&local.0)
}

/// Per-connection bijection between observed entities and local ids.
///
/// Dynamic ids freed during a frame sit in quarantine until `end_frame`, then are reused
/// smallest first. Reserved ids belong to one entity for the table's whole life.
#[derive(Debug)]
pub struct LocalIdTable {
    by_uid: HashMap<EntityUid, LocalId>,
    by_local: HashMap<LocalId, EntityUid>,
    reserved: HashMap<EntityUid, LocalId>,
    free: BTreeSet<LocalId>,
    quarantine: Vec<LocalId>,
    next_dynamic: u32,
}

impl Default for LocalIdTable {
    fn default() -> Self {
        Self {
            by_uid: HashMap::new(),
            by_local: HashMap::new(),
            reserved: HashMap::new(),
            free: BTreeSet::new(),
            quarantine: Vec::new(),
            next_dynamic: LOCAL_ID_DYNAMIC_FIRST,
        }
    }
}

impl LocalIdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `local` is bound or promised to any entity.
    pub fn is_claimed(&self, local: LocalId) -> bool {
        self.by_local.contains_key(&local) || self.reserved.values().any(|id| *id == local)
    }

    pub fn reserve(&mut self, uid: EntityUid, local: LocalId) {
        self.reserved.insert(uid, local);
    }

    pub fn bind(&mut self, uid: EntityUid) -> LocalId {
        if let Some(local) = self.by_uid.get(&uid) {
            return *local;
        }
        let local = match self.reserved.remove(&uid) {
            Some(local) => local,
            None => self.allocate_dynamic(),
        };
        self.by_uid.insert(uid, local);
        self.by_local.insert(local, uid);
        local
    }

    pub fn release(&mut self, uid: EntityUid) -> Option<LocalId> {
        let local = self.by_uid.remove(&uid)?;
        self.by_local.remove(&local);
        if is_reserved(local) {
            self.reserved.insert(uid, local);
        } else {
            self.quarantine.push(local);
        }
        Some(local)
    }

    pub fn end_frame(&mut self) {
        self.free.extend(self.quarantine.drain(..));
    }

    pub fn local_of(&self, uid: EntityUid) -> Option<LocalId> {
        self.by_uid.get(&uid).copied()
    }

    pub fn uid_of(&self, local: LocalId) -> Option<EntityUid> {
        self.by_local.get(&local).copied()
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }

    /// Checks the bijection against the set of entities the connection observes.
    pub fn matches(&self, observed: &BTreeSet<EntityUid>) -> bool {
        if self.by_uid.len() != observed.len() || self.by_local.len() != observed.len() {
            return false;
        }
        observed.iter().all(|uid| {
            self.by_uid
                .get(uid)
                .and_then(|local| self.by_local.get(local))
                == Some(uid)
        })
    }

    fn allocate_dynamic(&mut self) -> LocalId {
        if let Some(local) = self.free.pop_first() {
            return local;
        }
        let local = LocalId(self.next_dynamic);
        self.next_dynamic += 1;
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_ids_start_after_reserved_range() {
        let mut table = LocalIdTable::new();
        assert_eq!(table.bind(EntityUid(5)), LocalId(LOCAL_ID_DYNAMIC_FIRST));
        assert_eq!(table.bind(EntityUid(6)), LocalId(LOCAL_ID_DYNAMIC_FIRST + 1));
        assert_eq!(table.bind(EntityUid(5)), LocalId(LOCAL_ID_DYNAMIC_FIRST));
    }

    #[test]
    fn freed_ids_wait_for_frame_end() {
        let mut table = LocalIdTable::new();
        let first = table.bind(EntityUid(1));
        table.bind(EntityUid(2));
        assert_eq!(table.release(EntityUid(1)), Some(first));

        let during_frame = table.bind(EntityUid(3));
        assert_ne!(during_frame, first);

        table.end_frame();
        assert_eq!(table.bind(EntityUid(4)), first);
    }

    #[test]
    fn reuse_takes_smallest_free_id() {
        let mut table = LocalIdTable::new();
        for uid in 1..=3 {
            table.bind(EntityUid(uid));
        }
        table.release(EntityUid(3));
        table.release(EntityUid(1));
        table.end_frame();
        assert_eq!(table.bind(EntityUid(9)), LocalId(LOCAL_ID_DYNAMIC_FIRST));
    }

    #[test]
    fn reserved_id_survives_release() {
        let mut table = LocalIdTable::new();
        table.reserve(EntityUid(7), LocalId(LOCAL_ID_SELF_FIRST));
        assert!(table.is_claimed(LocalId(LOCAL_ID_SELF_FIRST)));
        assert_eq!(table.bind(EntityUid(7)), LocalId(LOCAL_ID_SELF_FIRST));

        table.release(EntityUid(7));
        table.end_frame();
        assert_eq!(table.bind(EntityUid(8)), LocalId(LOCAL_ID_DYNAMIC_FIRST));
        assert_eq!(table.bind(EntityUid(7)), LocalId(LOCAL_ID_SELF_FIRST));
    }

    #[test]
    fn bijection_check() {
        let mut table = LocalIdTable::new();
        table.bind(EntityUid(1));
        table.bind(EntityUid(2));
        assert!(table.matches(&BTreeSet::from([EntityUid(1), EntityUid(2)])));
        assert!(!table.matches(&BTreeSet::from([EntityUid(1)])));
    }
}
