use common_types::PersonId;

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub person_id: PersonId,
    pub distance: f32,
}

/// Nearest-centroid lookup by cosine distance.
///
/// The only implementation is an exact scan; an approximate index can take
/// its place without touching the engine.
pub trait CentroidIndex {
    /// Up to `k` clusters closest to `query`, nearest first. Equal distances
    /// are ordered by person id.
    fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.person_id.cmp(&b.person_id))
    });
}
