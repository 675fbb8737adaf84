//! Rank-indexed mapping from old to new process ids across a restart.
//!
//! After the application is relaunched every rank registers again and gets
//! a fresh registry id. Agents receive the map in `reinit` and use it to
//! rewrite the ids they track.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::RegistryId;

#[derive(Deserialize)]
struct RawIdMap {
    from: Vec<Option<RegistryId>>,
    to: Vec<RegistryId>,
}

/// Ordered `rank -> old id` and `rank -> new id` sequences of equal length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawIdMap")]
pub struct IdMap {
    from: Vec<Option<RegistryId>>,
    to: Vec<RegistryId>,
}

impl TryFrom<RawIdMap> for IdMap {
    type Error = CoreError;

    fn try_from(raw: RawIdMap) -> Result<Self, Self::Error> {
        IdMap::new(raw.from, raw.to)
    }
}

impl IdMap {
    pub fn new(from: Vec<Option<RegistryId>>, to: Vec<RegistryId>) -> Result<Self, CoreError> {
        if from.len() != to.len() {
            return Err(CoreError::IdMapLengthMismatch {
                from: from.len(),
                to: to.len(),
            });
        }
        Ok(IdMap { from, to })
    }

    /// Map for the first launch: no rank has a previous id.
    pub fn initial(to: Vec<RegistryId>) -> Self {
        IdMap {
            from: vec![None; to.len()],
            to,
        }
    }

    /// Builds the `to` side from `(rank, id)` pairs, requiring every rank
    /// in `0..num_ranks` to be present.
    pub fn collect_ranks(
        entries: impl IntoIterator<Item = (usize, RegistryId)>,
        num_ranks: usize,
    ) -> Result<Vec<RegistryId>, CoreError> {
        let mut slots: Vec<Option<RegistryId>> = vec![None; num_ranks];
        for (rank, id) in entries {
            let len = slots.len();
            let slot = slots
                .get_mut(rank)
                .ok_or(CoreError::RankOutOfRange { rank, len })?;
            *slot = Some(id);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(rank, id)| id.ok_or(CoreError::MissingRank { rank }))
            .collect()
    }

    /// Map for a relaunch: the previous targets become the sources.
    pub fn successor(&self, to: Vec<RegistryId>) -> Result<IdMap, CoreError> {
        IdMap::new(self.to.iter().copied().map(Some).collect(), to)
    }

    pub fn len(&self) -> usize {
        self.to.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to.is_empty()
    }

    /// New id of the process that previously had `old`.
    pub fn remap(&self, old: RegistryId) -> Option<RegistryId> {
        self.from
            .iter()
            .position(|&f| f == Some(old))
            .map(|rank| self.to[rank])
    }

    pub fn targets(&self) -> &[RegistryId] {
        &self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<RegistryId> {
        raw.iter().copied().map(RegistryId).collect()
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = IdMap::new(vec![None], ids(&[1, 2])).unwrap_err();
        assert!(matches!(err, CoreError::IdMapLengthMismatch { from: 1, to: 2 }));
    }

    #[test]
    fn successor_remaps_old_ids() {
        let first = IdMap::initial(ids(&[10, 11, 12]));
        assert_eq!(first.remap(RegistryId(10)), None);

        let second = first.successor(ids(&[20, 21, 22])).unwrap();
        assert_eq!(second.remap(RegistryId(11)), Some(RegistryId(21)));
        assert_eq!(second.remap(RegistryId(99)), None);
        assert_eq!(second.targets(), &ids(&[20, 21, 22])[..]);
    }

    #[test]
    fn successor_requires_same_rank_count() {
        let first = IdMap::initial(ids(&[1, 2]));
        assert!(first.successor(ids(&[3])).is_err());
    }

    #[test]
    fn collect_ranks_requires_every_rank() {
        let to = IdMap::collect_ranks(vec![(1, RegistryId(8)), (0, RegistryId(7))], 2).unwrap();
        assert_eq!(to, ids(&[7, 8]));

        let missing = IdMap::collect_ranks(vec![(0, RegistryId(7))], 2).unwrap_err();
        assert!(matches!(missing, CoreError::MissingRank { rank: 1 }));

        let outside = IdMap::collect_ranks(vec![(5, RegistryId(7))], 2).unwrap_err();
        assert!(matches!(outside, CoreError::RankOutOfRange { rank: 5, len: 2 }));
    }

    #[test]
    fn deserialize_checks_lengths() {
        let bad = serde_json::json!({ "from": [null], "to": [1, 2] });
        assert!(serde_json::from_value::<IdMap>(bad).is_err());

        let good = serde_json::json!({ "from": [1, null], "to": [3, 4] });
        let map: IdMap = serde_json::from_value(good).unwrap();
        assert_eq!(map.remap(RegistryId(1)), Some(RegistryId(3)));
    }
}
