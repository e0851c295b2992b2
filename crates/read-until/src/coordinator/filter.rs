use crate::{ChannelId, WorkUnit};
use std::collections::HashMap;

/// What the inbound loop should do with a received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Verdict {
    Cache,
    /// Cache the chunk and ask the server to stop sending its item.
    CacheAndStop,
    /// Do not cache the chunk, but still stop its item.
    StopOnly,
    Discard,
}

/// Per-session chunk admission: one-chunk mode and the classification
/// prefilter.
pub(super) struct ChunkFilter {
    one_chunk: bool,
    classes: Vec<i32>,
    /// Item each channel was last told to stop.
    stopped: HashMap<ChannelId, String>,
}

impl ChunkFilter {
    pub(super) fn new(one_chunk: bool, classes: Vec<i32>) -> Self {
        Self {
            one_chunk,
            classes,
            stopped: HashMap::new(),
        }
    }

    pub(super) fn inspect(&mut self, unit: &WorkUnit) -> Verdict {
        let stop = if self.one_chunk {
            // A stop that was not enacted in time. The item may already have
            // been consumed, so it must not reappear in the cache.
            if self.stopped.get(&unit.channel) == Some(&unit.item_id) {
                return Verdict::Discard;
            }
            self.stopped.insert(unit.channel, unit.item_id.clone());
            true
        } else {
            false
        };

        match (self.admits(unit), stop) {
            (true, true) => Verdict::CacheAndStop,
            (true, false) => Verdict::Cache,
            (false, true) => Verdict::StopOnly,
            (false, false) => Verdict::Discard,
        }
    }

    fn admits(&self, unit: &WorkUnit) -> bool {
        self.classes.is_empty()
            || unit
                .stats
                .classifications
                .iter()
                .any(|code| self.classes.contains(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkStats;

    fn chunk(channel: ChannelId, item: &str, classes: &[i32]) -> WorkUnit {
        WorkUnit {
            channel,
            item_id: item.to_string(),
            item_number: 1,
            sequence: 0,
            payload: bytes::Bytes::new(),
            start_sample: 0,
            chunk_start_sample: 0,
            chunk_length: 0,
            stats: ChunkStats {
                classifications: classes.to_vec(),
                ..ChunkStats::default()
            },
        }
    }

    #[test]
    fn passes_everything_by_default() {
        let mut filter = ChunkFilter::new(false, Vec::new());
        assert_eq!(filter.inspect(&chunk(1, "a", &[])), Verdict::Cache);
        assert_eq!(filter.inspect(&chunk(1, "a", &[80])), Verdict::Cache);
    }

    #[test]
    fn prefilter_requires_a_matching_class() {
        let mut filter = ChunkFilter::new(false, vec![83, 65]);
        assert_eq!(filter.inspect(&chunk(1, "a", &[80, 65])), Verdict::Cache);
        assert_eq!(filter.inspect(&chunk(1, "a", &[80])), Verdict::Discard);
        assert_eq!(filter.inspect(&chunk(1, "a", &[])), Verdict::Discard);
    }

    #[test]
    fn one_chunk_stops_each_item_once() {
        let mut filter = ChunkFilter::new(true, vec![83]);
        assert_eq!(filter.inspect(&chunk(3, "a", &[83])), Verdict::CacheAndStop);
        assert_eq!(filter.inspect(&chunk(3, "a", &[83])), Verdict::Discard);
        assert_eq!(filter.inspect(&chunk(4, "a", &[80])), Verdict::StopOnly);
        assert_eq!(filter.inspect(&chunk(3, "b", &[83])), Verdict::CacheAndStop);
    }
}
