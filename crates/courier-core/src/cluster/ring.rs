//! Consistent-hash ring over cluster nodes.

/// Ring of virtual points; each node owns the arc ending at each of its points.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: Vec<(u32, String)>,
}

impl HashRing {
    /// Build a ring with `replicas` points per node.
    #[must_use]
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a str>, replicas: usize) -> Self {
        let mut points: Vec<(u32, String)> = nodes
            .into_iter()
            .flat_map(|node| {
                (0..replicas.max(1)).map(move |i| {
                    let hash = crc32c::crc32c(format!("{node}#{i}").as_bytes());
                    (hash, node.to_string())
                })
            })
            .collect();
        // Ties break on node name so every node builds the same ring.
        points.sort();
        points.dedup_by(|a, b| a.0 == b.0);
        Self { points }
    }

    /// Node owning `key`, or `None` on an empty ring.
    #[must_use]
    pub fn owner(&self, key: &str) -> Option<&str> {
        let hash = crc32c::crc32c(key.as_bytes());
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        self.points
            .get(idx)
            .or_else(|| self.points.first())
            .map(|(_, node)| node.as_str())
    }

    /// Number of virtual points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the ring has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
