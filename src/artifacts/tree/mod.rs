//! Canonical tree iteration
//!
//! A tree payload is a run of entries `mode SP name NUL id20` with no
//! framing between them. Entries sort by name bytes, except that a
//! subtree entry named `N` sorts as if it were `N/` (the implicit-slash
//! rule), which keeps tree order identical to the order of the paths the
//! subtree contains.
//!
//! Forward iteration is a straight scan. Backward iteration has to
//! recover entry boundaries from behind: the previous entry's name ends
//! at a NUL exactly 21 bytes before the current entry start, and its own
//! start is found by scanning further back for a candidate NUL whose
//! following 20 id bytes land exactly on a verifiable `mode SP name NUL`
//! shape. Ids may legitimately contain 0x00 and 0x20 bytes, so every
//! candidate is verified structurally before being accepted.

use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::OBJECT_ID_LENGTH;
use anyhow::Context;
use bytes::Bytes;
use std::cmp::Ordering;

/// Mode bits of a subtree entry.
pub const MODE_TREE: u32 = 0o040000;

/// Mode bits of a regular file entry.
pub const MODE_REGULAR: u32 = 0o100644;

/// Mode bits of an executable file entry.
pub const MODE_EXECUTABLE: u32 = 0o100755;

/// Mode bits of a symlink entry.
pub const MODE_SYMLINK: u32 = 0o120000;

/// Mode bits of a submodule (gitlink) entry.
pub const MODE_GITLINK: u32 = 0o160000;

/// One `(mode, name, id)` tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: Bytes,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn is_tree(&self) -> bool {
        self.mode & 0o170000 == MODE_TREE
    }
}

/// Compare entry names in git tree order.
///
/// `a_is_tree`/`b_is_tree` trigger the implicit trailing `/`.
pub fn path_compare(a: &[u8], a_is_tree: bool, b: &[u8], b_is_tree: bool) -> Ordering {
    let common = a.len().min(b.len());
    match a[..common].cmp(&b[..common]) {
        Ordering::Equal => {
            let a_next = a.get(common).copied().or(a_is_tree.then_some(b'/'));
            let b_next = b.get(common).copied().or(b_is_tree.then_some(b'/'));
            a_next.cmp(&b_next)
        }
        ordering => ordering,
    }
}

/// Cursor over a canonical tree payload.
#[derive(Debug, Clone)]
pub struct CanonicalTreeParser {
    buffer: Bytes,
    /// Start offset of the next entry to yield.
    position: usize,
}

impl CanonicalTreeParser {
    pub fn new(buffer: Bytes) -> Self {
        CanonicalTreeParser { buffer, position: 0 }
    }

    /// Whether the cursor is past the last entry.
    pub fn at_end(&self) -> bool {
        self.position >= self.buffer.len()
    }

    /// Whether the cursor is before the first entry.
    pub fn at_start(&self) -> bool {
        self.position == 0
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Yield the entry at the cursor and advance past it.
    pub fn next(&mut self) -> anyhow::Result<Option<TreeEntry>> {
        if self.at_end() {
            return Ok(None);
        }
        let (entry, next_position) = parse_entry(&self.buffer, self.position)?;
        self.position = next_position;
        Ok(Some(entry))
    }

    /// Step the cursor back one entry and yield it.
    ///
    /// After a full forward pass, repeated calls return every entry in
    /// exact reverse order.
    pub fn back(&mut self) -> anyhow::Result<Option<TreeEntry>> {
        if self.at_start() {
            return Ok(None);
        }
        let start = previous_entry_start(&self.buffer, self.position)
            .context("unable to recover tree entry boundary scanning backward")?;
        let (entry, end) = parse_entry(&self.buffer, start)?;
        if end != self.position {
            anyhow::bail!("tree entry boundary recovered at {start} does not line up");
        }
        self.position = start;
        Ok(Some(entry))
    }

    /// Find `name` in this tree by scanning in order.
    ///
    /// Tree order lets the scan stop early once entries sort past the
    /// probe for both the file and the subtree interpretation.
    pub fn find(&self, name: &[u8]) -> anyhow::Result<Option<TreeEntry>> {
        let mut cursor = self.clone();
        cursor.reset();
        while let Some(entry) = cursor.next()? {
            if entry.name.as_ref() == name {
                return Ok(Some(entry));
            }
            let past_file = path_compare(&entry.name, entry.is_tree(), name, false)
                == Ordering::Greater;
            let past_tree = path_compare(&entry.name, entry.is_tree(), name, true)
                == Ordering::Greater;
            if past_file && past_tree {
                break;
            }
        }
        Ok(None)
    }
}

/// Parse the entry starting at `start`; returns it plus the next start.
fn parse_entry(buffer: &Bytes, start: usize) -> anyhow::Result<(TreeEntry, usize)> {
    let bytes = &buffer[..];
    let mut position = start;

    let mut mode: u32 = 0;
    let mut mode_digits = 0;
    while position < bytes.len() && bytes[position] != b' ' {
        let digit = bytes[position];
        if !(b'0'..=b'7').contains(&digit) || mode_digits >= 7 {
            anyhow::bail!("malformed tree entry mode at offset {start}");
        }
        mode = (mode << 3) | u32::from(digit - b'0');
        mode_digits += 1;
        position += 1;
    }
    if mode_digits == 0 || position >= bytes.len() {
        anyhow::bail!("malformed tree entry mode at offset {start}");
    }
    position += 1; // the SP

    let name_start = position;
    while position < bytes.len() && bytes[position] != 0 {
        position += 1;
    }
    if position == name_start || position >= bytes.len() {
        anyhow::bail!("malformed tree entry name at offset {start}");
    }
    let name = buffer.slice(name_start..position);
    position += 1; // the NUL

    if position + OBJECT_ID_LENGTH > bytes.len() {
        anyhow::bail!("tree entry id truncated at offset {start}");
    }
    let id = ObjectId::from_bytes(&bytes[position..position + OBJECT_ID_LENGTH])
        .expect("slice is exactly 20 bytes");

    Ok((
        TreeEntry {
            mode,
            name,
            id,
        },
        position + OBJECT_ID_LENGTH,
    ))
}

/// Recover the start offset of the entry ending exactly at `end`.
///
/// The entry's id occupies `end - 20 ..end` and its name's NUL sits at
/// `end - 21`. Its start is either the buffer start or 21 bytes past the
/// NUL terminating the entry before it. Candidate NULs are scanned from
/// the back; each is confirmed by re-parsing the candidate entry and
/// checking that its name terminator is exactly the NUL at `end - 21`,
/// which weeds out 0x00 bytes inside ids.
fn previous_entry_start(buffer: &Bytes, end: usize) -> Option<usize> {
    let bytes = &buffer[..];
    if end < OBJECT_ID_LENGTH + 2 {
        return None;
    }
    let name_nul = end - OBJECT_ID_LENGTH - 1;
    if bytes[name_nul] != 0 {
        return None;
    }

    // candidate starts walk backward: each NUL q implies a start q + 21
    let mut candidate = name_nul;
    loop {
        let start = if candidate >= OBJECT_ID_LENGTH + 1 {
            match bytes[..candidate - OBJECT_ID_LENGTH]
                .iter()
                .rposition(|&b| b == 0)
            {
                Some(q) => {
                    candidate = q + OBJECT_ID_LENGTH;
                    q + OBJECT_ID_LENGTH + 1
                }
                None => 0,
            }
        } else {
            0
        };

        if let Ok((_, parsed_end)) = parse_entry(buffer, start) {
            if parsed_end == end {
                return Some(start);
            }
        }
        if start == 0 {
            return None;
        }
        // the candidate NUL was inside an id; keep scanning back
    }
}

/// Append one entry to a tree payload under construction.
pub fn append_entry(buffer: &mut Vec<u8>, mode: u32, name: &[u8], id: &ObjectId) {
    buffer.extend_from_slice(format!("{mode:o}").as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(name);
    buffer.push(0);
    buffer.extend_from_slice(id.as_bytes());
}

/// Walk `path` through nested trees starting from a root tree payload.
///
/// `load_tree` materializes a subtree payload by id. Returns the matched
/// entry, `None` on a missing component or a non-tree in the middle of
/// the path. The empty path names no entry and also yields `None`;
/// callers wanting "the tree itself" handle that case before descending.
pub fn lookup_path(
    load_tree: impl Fn(&ObjectId) -> anyhow::Result<Bytes>,
    root: Bytes,
    path: &str,
) -> anyhow::Result<Option<TreeEntry>> {
    let mut current = root;
    let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();

    while let Some(component) = components.next() {
        let parser = CanonicalTreeParser::new(current);
        let Some(entry) = parser.find(component.as_bytes())? else {
            return Ok(None);
        };
        if components.peek().is_none() {
            return Ok(Some(entry));
        }
        if !entry.is_tree() {
            return Ok(None);
        }
        current = load_tree(&entry.id)?;
    }
    Ok(None)
}
