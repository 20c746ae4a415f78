//! Fixed binary layout of the registry region.
//!
//! ```text
//! header (32 bytes)
//!   0..8    magic "FJREGION"
//!   8..12   layout version (u32 le)
//!   12..16  max_items (u32 le)
//!   16..20  slot size (u32 le)
//!   20..24  attached server handles (u32 le)
//!   24..32  reserved
//! slot (256 bytes, repeated max_items times)
//!   0       tag: 0 = sentinel, 1 = occupied
//!   1..66   task_id   (u8 len + 64 bytes)
//!   66..115 status    (u8 len + 48 bytes)
//!   115..123 created_at, unix millis (i64 le)
//!   123..131 updated_at, unix millis (i64 le)
//!   131..135 file_count (u32 le)
//!   135..200 output_path (u8 len + 64 bytes)
//!   200..256 reserved
//! ```

use std::path::Path;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::job::{status, TaskId, MAX_TASK_ID_LEN};

pub const MAGIC: [u8; 8] = *b"FJREGION";
pub const LAYOUT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 32;
pub const SLOT_SIZE: usize = 256;
pub const MAX_STATUS_LEN: usize = 48;
pub const MAX_OUTPUT_LEN: usize = 64;
/// Offset of the attached-handle count within the header.
pub const ATTACHED_OFFSET: u64 = 20;
/// Upper bound on `max_items` accepted by [`encode_header`].
pub const MAX_SLOTS: usize = 4096;

const TAG_SENTINEL: u8 = 0;
const TAG_OCCUPIED: u8 = 1;
const ELLIPSIS: &str = "...";

/// Compact summary of one registered task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub file_count: u32,
    /// Destination, cut to the configured display length.
    pub output_path: String,
}

impl TaskRecord {
    /// Fresh record in the `starting` state.
    pub fn new(task_id: TaskId, file_count: usize, output: &str, display_len: usize) -> Self {
        let now = now_millis();
        Self {
            task_id,
            status: status::STARTING.to_string(),
            created_at: now,
            updated_at: now,
            file_count: u32::try_from(file_count).unwrap_or(u32::MAX),
            output_path: display_path(output, display_len),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Set a new status and bump `updated_at`.
    pub fn touch(&mut self, status: &str) {
        self.status = status.to_string();
        self.updated_at = now_millis();
    }
}

/// Current time at the millisecond precision a slot stores.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Cut `path` to `max_chars` characters, marking the cut with `...`.
///
/// The result never exceeds the [`MAX_OUTPUT_LEN`] bytes a slot stores, so
/// a record reads back exactly as it was written.
pub fn display_path(path: &str, max_chars: usize) -> String {
    let by_chars = match path.char_indices().nth(max_chars) {
        Some((end, _)) => &path[..end],
        None => path,
    };
    if by_chars.len() == path.len() && path.len() <= MAX_OUTPUT_LEN {
        return path.to_string();
    }
    let mut cut = fit(by_chars, MAX_OUTPUT_LEN - ELLIPSIS.len()).to_string();
    cut.push_str(ELLIPSIS);
    cut
}

/// Decoded content of one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Sentinel,
    Occupied(TaskRecord),
}

impl Slot {
    pub fn record(&self) -> Option<&TaskRecord> {
        match self {
            Slot::Sentinel => None,
            Slot::Occupied(record) => Some(record),
        }
    }

    pub fn holds(&self, task_id: &TaskId) -> bool {
        self.record().is_some_and(|r| &r.task_id == task_id)
    }

    /// Identifier shown for this slot in raw listings.
    pub fn label(&self, index: usize) -> String {
        match self {
            Slot::Sentinel => format!("#empty_slot_{index}"),
            Slot::Occupied(record) => record.task_id.to_string(),
        }
    }

    /// Status shown for this slot in raw listings and counts.
    pub fn status(&self) -> &str {
        match self {
            Slot::Sentinel => status::EMPTY,
            Slot::Occupied(record) => &record.status,
        }
    }

    pub fn encode(&self) -> Result<[u8; SLOT_SIZE], RegistryError> {
        let mut w = Writer::default();
        match self {
            Slot::Sentinel => w.put_u8(TAG_SENTINEL),
            Slot::Occupied(record) => {
                w.put_u8(TAG_OCCUPIED);
                w.put_exact("task_id", record.task_id.as_str(), MAX_TASK_ID_LEN)?;
                w.put_truncated(&record.status, MAX_STATUS_LEN);
                w.put_i64(record.created_at.timestamp_millis());
                w.put_i64(record.updated_at.timestamp_millis());
                w.put_u32(record.file_count);
                w.put_truncated(&record.output_path, MAX_OUTPUT_LEN);
            }
        }
        Ok(w.buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Slot, String> {
        if buf.len() != SLOT_SIZE {
            return Err(format!("slot is {} bytes", buf.len()));
        }
        let mut r = Reader { buf, pos: 0 };
        match r.u8() {
            TAG_SENTINEL => Ok(Slot::Sentinel),
            TAG_OCCUPIED => {
                let task_id = r.string(MAX_TASK_ID_LEN)?;
                let task_id = TaskId::parse(task_id).map_err(|e| e.to_string())?;
                let status = r.string(MAX_STATUS_LEN)?;
                let created_at = r.timestamp()?;
                let updated_at = r.timestamp()?;
                let file_count = r.u32();
                let output_path = r.string(MAX_OUTPUT_LEN)?;
                Ok(Slot::Occupied(TaskRecord {
                    task_id,
                    status,
                    created_at,
                    updated_at,
                    file_count,
                    output_path,
                }))
            }
            tag => Err(format!("unknown slot tag {tag}")),
        }
    }
}

pub fn encode_header(max_items: usize) -> Result<[u8; HEADER_SIZE], RegistryError> {
    if max_items == 0 || max_items > MAX_SLOTS {
        return Err(RegistryError::InvalidCapacity {
            requested: max_items,
            max: MAX_SLOTS,
        });
    }
    let mut header = [0u8; HEADER_SIZE];
    header[0..8].copy_from_slice(&MAGIC);
    header[8..12].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(max_items as u32).to_le_bytes());
    header[16..20].copy_from_slice(&(SLOT_SIZE as u32).to_le_bytes());
    Ok(header)
}

/// Validate a header and return its `max_items`.
pub fn decode_header(header: &[u8; HEADER_SIZE], path: &Path) -> Result<usize, RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidRegion {
        path: path.to_path_buf(),
        reason,
    };
    if header[0..8] != MAGIC {
        return Err(invalid("bad magic".into()));
    }
    let version = read_u32(&header[8..12]);
    if version != LAYOUT_VERSION {
        return Err(invalid(format!("layout version {version}")));
    }
    let slot_size = read_u32(&header[16..20]) as usize;
    if slot_size != SLOT_SIZE {
        return Err(invalid(format!("slot size {slot_size}")));
    }
    let max_items = read_u32(&header[12..16]) as usize;
    if max_items == 0 || max_items > MAX_SLOTS {
        return Err(invalid(format!("max_items {max_items}")));
    }
    Ok(max_items)
}

/// Total region size for `max_items` slots.
pub fn region_len(max_items: usize) -> u64 {
    (HEADER_SIZE + max_items * SLOT_SIZE) as u64
}

/// Byte offset of slot `index` within the region.
pub fn slot_offset(index: usize) -> u64 {
    (HEADER_SIZE + index * SLOT_SIZE) as u64
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

/// Longest prefix of `s` that fits `max` bytes without splitting a char.
fn fit(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

struct Writer {
    buf: [u8; SLOT_SIZE],
    pos: usize,
}

impl Default for Writer {
    fn default() -> Self {
        Self {
            buf: [0u8; SLOT_SIZE],
            pos: 0,
        }
    }
}

impl Writer {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    fn put_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.put(&value.to_le_bytes());
    }

    /// Length-prefixed field occupying `1 + max` bytes.
    fn put_field(&mut self, s: &str, max: usize) {
        self.put_u8(s.len() as u8);
        self.put(s.as_bytes());
        self.pos += max - s.len();
    }

    fn put_exact(&mut self, field: &'static str, s: &str, max: usize) -> Result<(), RegistryError> {
        if s.len() > max {
            return Err(RegistryError::FieldTooLong {
                field,
                len: s.len(),
                max,
            });
        }
        self.put_field(s, max);
        Ok(())
    }

    fn put_truncated(&mut self, s: &str, max: usize) {
        self.put_field(fit(s, max), max);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> &[u8] {
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        bytes
    }

    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn u32(&mut self) -> u32 {
        read_u32(self.take(4))
    }

    fn i64(&mut self) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8));
        i64::from_le_bytes(raw)
    }

    fn string(&mut self, max: usize) -> Result<String, String> {
        let len = self.u8() as usize;
        if len > max {
            return Err(format!("field length {len} exceeds {max}"));
        }
        let field = self.take(max);
        String::from_utf8(field[..len].to_vec()).map_err(|e| e.to_string())
    }

    fn timestamp(&mut self) -> Result<DateTime<Utc>, String> {
        let millis = self.i64();
        DateTime::from_timestamp_millis(millis).ok_or_else(|| format!("timestamp {millis}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> TaskRecord {
        TaskRecord::new(TaskId::parse(id).unwrap(), 3, "/exports/site-a/flows.ipfix", 50)
    }

    #[test]
    fn field_offsets_fit_in_a_slot() {
        // tag + task_id + status + 2 timestamps + file_count + output_path
        let used = 1 + (1 + MAX_TASK_ID_LEN) + (1 + MAX_STATUS_LEN) + 8 + 8 + 4 + (1 + MAX_OUTPUT_LEN);
        assert_eq!(used, 200);
        assert!(used <= SLOT_SIZE);
    }

    #[test]
    fn occupied_slot_survives_encoding() {
        let slot = Slot::Occupied(record("task_1700000000_deadbeef").with_status("running"));
        let bytes = slot.encode().unwrap();
        assert_eq!(Slot::decode(&bytes).unwrap(), slot);
    }

    #[test]
    fn zeroed_bytes_decode_as_sentinel() {
        assert_eq!(Slot::decode(&[0u8; SLOT_SIZE]).unwrap(), Slot::Sentinel);
        assert_eq!(Slot::Sentinel.encode().unwrap(), [0u8; SLOT_SIZE]);
    }

    #[test]
    fn long_status_is_cut_on_a_char_boundary() {
        let status = "é".repeat(30); // 60 bytes
        let slot = Slot::Occupied(record("t").with_status(status));
        let decoded = Slot::decode(&slot.encode().unwrap()).unwrap();
        let stored = decoded.record().unwrap().status.clone();
        assert_eq!(stored, "é".repeat(24));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[0] = 9;
        assert!(Slot::decode(&bytes).is_err());
    }

    #[test]
    fn sentinel_labels_carry_their_index() {
        assert_eq!(Slot::Sentinel.label(4), "#empty_slot_4");
        assert_eq!(Slot::Sentinel.status(), "empty");
    }

    #[test]
    fn output_path_is_cut_for_display() {
        let long = "a".repeat(60);
        assert_eq!(display_path(&long, 50), format!("{}...", "a".repeat(50)));
        assert_eq!(display_path("/short", 50), "/short");
    }

    #[test]
    fn multibyte_output_path_fits_the_slot() {
        let path = "/导出/流量".repeat(5);
        let rec = TaskRecord::new(TaskId::parse("wide").unwrap(), 1, &path, 50);
        assert!(rec.output_path.len() <= MAX_OUTPUT_LEN);
        assert!(rec.output_path.ends_with("..."));
        assert!(path.starts_with(rec.output_path.trim_end_matches("...")));

        let slot = Slot::Occupied(rec);
        assert_eq!(Slot::decode(&slot.encode().unwrap()).unwrap(), slot);
    }

    #[test]
    fn wide_display_length_is_bounded_by_the_slot() {
        let long = "b".repeat(100);
        let shown = display_path(&long, 90);
        assert_eq!(shown.len(), MAX_OUTPUT_LEN);
        assert_eq!(shown, format!("{}...", "b".repeat(MAX_OUTPUT_LEN - 3)));

        let exact = "c".repeat(MAX_OUTPUT_LEN);
        assert_eq!(display_path(&exact, 90), exact);
    }

    #[test]
    fn header_round_trip_and_validation() {
        let header = encode_header(15).unwrap();
        assert_eq!(decode_header(&header, Path::new("/r")).unwrap(), 15);

        let mut bad = header;
        bad[0] = b'X';
        assert!(matches!(
            decode_header(&bad, Path::new("/r")),
            Err(RegistryError::InvalidRegion { .. })
        ));
        assert!(matches!(
            encode_header(0),
            Err(RegistryError::InvalidCapacity { .. })
        ));
    }
}
