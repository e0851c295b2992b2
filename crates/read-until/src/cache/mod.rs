//! Per-channel cache of the freshest unconsumed chunk.
//!
//! The cache is a fixed arena of slots, one per channel in the configured
//! range, allocated once. A slot holds at most one item. A chunk of a
//! *different* item always evicts what the slot holds, consumed or not, so
//! analysis code never acts on an item that has already ended upstream.
//! Capacity never changes and nothing is evicted for memory pressure.
//!
//! ## Locking
//!
//! Each slot has its own mutex, so producers touching different channels never
//! contend. [`ChannelCache::put`] also holds a shared gate; [`ChannelCache::pop_all`]
//! takes that gate exclusively for the duration of one pass over the slots,
//! which makes the drain an atomic snapshot with respect to concurrent puts.
//! [`ChannelCache::pop_batch`] does the same for a partial drain.
//!
//! Every stored chunk stamps its slot from a cache-wide counter, so slots can
//! be drained in order of their last update.

use crate::{CacheMode, ChannelId, Error, OutOfOrderPolicy, Result, StreamSetup, WorkUnit};
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};


#[cfg(feature = "cache-padded")]
type Slot = crossbeam_utils::CachePadded<Mutex<Option<Entry>>>;
#[cfg(not(feature = "cache-padded"))]
type Slot = Mutex<Option<Entry>>;

/// A cached item plus the buffer its chunks are accumulated into.
///
/// The accumulation buffer is only materialized on the first merge, and is
/// frozen back into the unit's payload when the entry leaves the cache.
struct Entry {
    unit: WorkUnit,
    merged: Option<BytesMut>,
    /// Value of the update clock when the slot last changed.
    stamp: u64,
}

impl Entry {
    const fn new(unit: WorkUnit, stamp: u64) -> Self {
        Self {
            unit,
            merged: None,
            stamp,
        }
    }

    fn append(&mut self, chunk: WorkUnit) {
        let merged = self
            .merged
            .get_or_insert_with(|| BytesMut::from(&self.unit.payload[..]));
        merged.extend_from_slice(&chunk.payload);

        let unit = &mut self.unit;
        unit.chunk_length += chunk.chunk_length;
        unit.sequence = chunk.sequence;
        unit.item_number = chunk.item_number;
        unit.stats = chunk.stats;
    }

    fn into_unit(self) -> WorkUnit {
        let mut unit = self.unit;
        if let Some(merged) = self.merged {
            unit.payload = merged.freeze();
        }
        unit
    }
}

/// How a chunk landed in its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The slot was empty.
    Inserted,
    /// The slot held a different item, which was discarded unconsumed.
    Superseded,
    /// The slot held the same item, which was overwritten.
    Replaced,
    /// The chunk was appended to the same item.
    Accumulated,
}

/// Which slots [`ChannelCache::pop_batch`] takes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PopOrder {
    /// Most recently updated first.
    #[default]
    Newest,
    /// Least recently updated first.
    Oldest,
}

/// Counters describing what the cache has discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Items superseded by a different item before anyone consumed them.
    pub missed: u64,
    /// Chunks overwritten or merged by a chunk of the same item.
    pub replaced: u64,
    /// Chunks rejected for a channel outside the range.
    pub out_of_range: u64,
    /// Chunks whose sequence failed to advance while accumulating.
    pub out_of_order: u64,
}

#[derive(Default)]
struct Counters {
    missed: AtomicU64,
    replaced: AtomicU64,
    out_of_range: AtomicU64,
    out_of_order: AtomicU64,
}

/// Bounded, channel-keyed store of the latest work unit per channel.
pub struct ChannelCache {
    first: ChannelId,
    last: ChannelId,
    mode: CacheMode,
    gate: RwLock<()>,
    slots: Box<[Slot]>,
    occupied: AtomicUsize,
    clock: AtomicU64,
    counters: Counters,
}

impl ChannelCache {
    /// Allocates one slot per channel in `first..=last`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the range is empty or starts at 0.
    pub fn new(first: ChannelId, last: ChannelId, mode: CacheMode) -> Result<Self> {
        let setup = StreamSetup {
            first_channel: first,
            last_channel: last,
            ..StreamSetup::default()
        };
        setup.validate()?;

        let slots = (0..setup.channel_count())
            .map(|_| Slot::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            first,
            last,
            mode,
            gate: RwLock::new(()),
            slots,
            occupied: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    /// Builds a cache covering the channel range of `setup`.
    pub fn for_setup(setup: &StreamSetup, mode: CacheMode) -> Result<Self> {
        Self::new(setup.first_channel, setup.last_channel, mode)
    }

    pub const fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Inclusive channel range served by the cache.
    pub const fn channels(&self) -> (ChannelId, ChannelId) {
        (self.first, self.last)
    }

    /// Number of slots, i.e. the largest possible [`len`](Self::len).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            missed: self.counters.missed.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            out_of_range: self.counters.out_of_range.load(Ordering::Relaxed),
            out_of_order: self.counters.out_of_order.load(Ordering::Relaxed),
        }
    }

    fn slot_index(&self, channel: ChannelId) -> Result<usize> {
        if channel < self.first || channel > self.last {
            self.counters.out_of_range.fetch_add(1, Ordering::Relaxed);
            return Err(Error::OutOfRange {
                channel,
                first: self.first,
                last: self.last,
            });
        }
        Ok((channel - self.first) as usize)
    }

    /// Stores `unit` in its channel's slot.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfRange`] if the channel is not served by this cache.
    /// - [`Error::OutOfOrderChunk`] if accumulating with
    ///   [`OutOfOrderPolicy::Drop`] and the chunk's sequence does not advance
    ///   past the cached one. The chunk is discarded.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all, fields(channel = unit.channel)))]
    pub fn put(&self, unit: WorkUnit) -> Result<Placement> {
        let index = self.slot_index(unit.channel)?;

        let _gate = self.gate.read();
        let mut slot = self.slots[index].lock();
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);

        let Some(entry) = slot.as_mut() else {
            *slot = Some(Entry::new(unit, stamp));
            self.occupied.fetch_add(1, Ordering::Relaxed);
            return Ok(Placement::Inserted);
        };

        if entry.unit.item_id != unit.item_id {
            self.counters.missed.fetch_add(1, Ordering::Relaxed);
            *entry = Entry::new(unit, stamp);
            return Ok(Placement::Superseded);
        }

        let CacheMode::Accumulate { on_out_of_order } = self.mode else {
            self.counters.replaced.fetch_add(1, Ordering::Relaxed);
            *entry = Entry::new(unit, stamp);
            return Ok(Placement::Replaced);
        };

        if unit.sequence <= entry.unit.sequence {
            self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "Out-of-order chunk on channel {}: {} after {}",
                unit.channel,
                unit.sequence,
                entry.unit.sequence
            );
            return match on_out_of_order {
                OutOfOrderPolicy::Drop => Err(Error::OutOfOrderChunk {
                    channel: unit.channel,
                    last: entry.unit.sequence,
                    received: unit.sequence,
                }),
                OutOfOrderPolicy::Replace => {
                    *entry = Entry::new(unit, stamp);
                    Ok(Placement::Replaced)
                }
            };
        }

        self.counters.replaced.fetch_add(1, Ordering::Relaxed);
        entry.append(unit);
        entry.stamp = stamp;
        Ok(Placement::Accumulated)
    }

    /// Removes and returns every cached unit, leaving all slots empty.
    ///
    /// The result is ordered by channel, but callers should not rely on any
    /// particular order.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub fn pop_all(&self) -> Vec<(ChannelId, WorkUnit)> {
        let _gate = self.gate.write();

        let mut drained = Vec::with_capacity(self.occupied.load(Ordering::Relaxed));
        for slot in &*self.slots {
            if let Some(entry) = slot.lock().take() {
                let unit = entry.into_unit();
                drained.push((unit.channel, unit));
            }
        }
        self.occupied.fetch_sub(drained.len(), Ordering::Relaxed);
        drained
    }

    /// Removes and returns at most `max` units, chosen by how recently their
    /// slot was updated. The rest stay cached.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub fn pop_batch(&self, max: usize, order: PopOrder) -> Vec<(ChannelId, WorkUnit)> {
        let _gate = self.gate.write();

        let mut stamped = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.lock().as_ref().map(|entry| (entry.stamp, index)))
            .collect::<Vec<_>>();
        match order {
            PopOrder::Newest => stamped.sort_unstable_by(|a, b| b.cmp(a)),
            PopOrder::Oldest => stamped.sort_unstable(),
        }

        let taken = stamped
            .into_iter()
            .take(max)
            .filter_map(|(_, index)| self.slots[index].lock().take())
            .map(|entry| {
                let unit = entry.into_unit();
                (unit.channel, unit)
            })
            .collect::<Vec<_>>();
        self.occupied.fetch_sub(taken.len(), Ordering::Relaxed);
        taken
    }

    /// Drops every cached unit. Counters are kept.
    pub fn clear(&self) {
        let _ = self.pop_all();
    }
}
