use bytes::Bytes;

/// A physical acquisition channel. Numbering starts at 1.
pub type ChannelId = u32;

/// One streamed chunk of signal for a channel.
///
/// A sequence of chunks sharing an `item_id` forms one logical item (a read).
/// The cache treats `payload` and [`ChunkStats`] as opaque; only `channel`,
/// `item_id`, `sequence` and the length metadata drive its decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub channel: ChannelId,
    /// Globally unique identifier of the item this chunk belongs to.
    pub item_id: String,
    /// Per-channel item counter; the server accepts it as an action target.
    pub item_number: u32,
    /// Increases with every chunk of a channel, not necessarily by one.
    pub sequence: u64,
    /// Raw signal bytes.
    pub payload: Bytes,
    /// Absolute sample at which the item started.
    pub start_sample: u64,
    /// Absolute sample at which this chunk (or the first accumulated chunk)
    /// starts.
    pub chunk_start_sample: u64,
    /// Number of samples covered by `payload`.
    pub chunk_length: u64,
    pub stats: ChunkStats,
}

/// Auxiliary per-chunk values computed upstream.
///
/// When chunks are accumulated the newest values win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkStats {
    pub median_before: f32,
    pub median: f32,
    /// Classification codes assigned to the chunk; see
    /// [`READ_CLASSIFICATIONS`].
    pub classifications: Vec<i32>,
}

impl WorkUnit {
    /// Absolute sample one past the end of the covered span.
    pub const fn chunk_end_sample(&self) -> u64 {
        self.chunk_start_sample + self.chunk_length
    }
}

/// Standard read classification codes reported in
/// [`ChunkStats::classifications`].
pub const READ_CLASSIFICATIONS: &[(i32, &str)] = &[
    (83, "strand"),
    (67, "strand1"),
    (77, "multiple"),
    (90, "zero"),
    (65, "adapter"),
    (66, "mux_uncertain"),
    (70, "user2"),
    (68, "user1"),
    (69, "event"),
    (80, "pore"),
    (85, "unavailable"),
    (84, "transition"),
    (78, "unclassed"),
];

/// Looks up the classification code for a name such as `"strand"`.
pub fn classification_code(name: &str) -> Option<i32> {
    READ_CLASSIFICATIONS
        .iter()
        .find(|(_, n)| n.eq_ignore_ascii_case(name))
        .map(|(code, _)| *code)
}

/// Looks up the name of a classification code.
pub fn classification_name(code: i32) -> Option<&'static str> {
    READ_CLASSIFICATIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}
