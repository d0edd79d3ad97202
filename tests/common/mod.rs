//! Shared fixtures for integration tests
//!
//! Builds real repositories in temporary directories: objects are
//! inserted through the loose store (so every id is a true SHA-1 of its
//! content) and packs are synthesized byte-for-byte with genuine zlib
//! streams, CRC columns, and trailer hashes.

#![allow(dead_code)]

use assert_fs::TempDir;
use byteorder::{BigEndian, WriteBytesExt};
use grit::artifacts::objects::commit::{Commit, Identity};
use grit::artifacts::objects::tag::Tag;
use grit::artifacts::pack::delta;
use grit::artifacts::tree::{append_entry, path_compare, MODE_TREE};
use grit::{ObjectId, ObjectType, RefUpdateResult, Repository};
use sha1::{Digest, Sha1};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A throwaway repository the tests drive through the public API.
pub struct FixtureRepository {
    pub dir: TempDir,
    pub repo: Repository,
}

impl FixtureRepository {
    /// Create a bare-layout git directory and open it.
    pub fn new() -> FixtureRepository {
        let dir = TempDir::new().expect("temp dir");
        let git_dir = dir.path();
        std::fs::create_dir_all(git_dir.join("objects")).unwrap();
        std::fs::create_dir_all(git_dir.join("refs").join("heads")).unwrap();
        std::fs::write(git_dir.join("HEAD"), "ref: refs/heads/master\n").unwrap();

        let repo = Repository::open(git_dir).expect("open fixture repository");
        FixtureRepository { dir, repo }
    }

    pub fn git_dir(&self) -> &Path {
        self.repo.git_dir()
    }

    /// A deterministic identity for commit and tag fixtures.
    pub fn identity(seconds: i64) -> Identity {
        Identity::parse(&format!("A U Thor <author@example.com> {seconds} +0000")).unwrap()
    }

    pub fn blob(&self, content: &[u8]) -> ObjectId {
        self.repo
            .new_inserter()
            .insert(ObjectType::Blob, content)
            .expect("insert blob")
    }

    /// Build and store a tree; entries are sorted into tree order here
    /// so call sites can list them naturally.
    pub fn tree(&self, entries: &[(u32, &str, ObjectId)]) -> ObjectId {
        let mut sorted: Vec<_> = entries.to_vec();
        sorted.sort_by(|a, b| {
            path_compare(
                a.1.as_bytes(),
                a.0 == MODE_TREE,
                b.1.as_bytes(),
                b.0 == MODE_TREE,
            )
        });

        let mut payload = Vec::new();
        for (mode, name, id) in &sorted {
            append_entry(&mut payload, *mode, name.as_bytes(), id);
        }
        self.repo
            .new_inserter()
            .insert(ObjectType::Tree, &payload)
            .expect("insert tree")
    }

    pub fn commit(&self, tree: ObjectId, parents: &[ObjectId], seconds: i64) -> ObjectId {
        let commit = Commit::new(
            tree,
            parents.to_vec(),
            Self::identity(seconds),
            format!("commit at {seconds}"),
        );
        self.repo
            .new_inserter()
            .insert(ObjectType::Commit, &commit.to_payload())
            .expect("insert commit")
    }

    pub fn tag(&self, target: ObjectId, kind: ObjectType, name: &str) -> ObjectId {
        let tag = Tag::new(target, kind, name, Self::identity(1_300_000_000), "release");
        self.repo
            .new_inserter()
            .insert(ObjectType::Tag, &tag.to_payload())
            .expect("insert tag")
    }

    /// A linear first-parent chain of `length` commits, oldest first.
    pub fn linear_history(&self, length: usize) -> Vec<ObjectId> {
        let mut commits = Vec::with_capacity(length);
        let mut parent: Option<ObjectId> = None;
        for step in 0..length {
            let blob = self.blob(format!("content {step}").as_bytes());
            let tree = self.tree(&[(0o100644, "file.txt", blob)]);
            let parents: Vec<_> = parent.into_iter().collect();
            let commit = self.commit(tree, &parents, 1_200_000_000 + step as i64);
            parent = Some(commit);
            commits.push(commit);
        }
        commits
    }

    /// Point `name` at `id` through the public update path.
    pub fn set_ref(&self, name: &str, id: ObjectId) {
        let mut update = self.repo.update_ref(name);
        update
            .set_new_object_id(id)
            .set_force_update(true)
            .set_reflog_message("update by fixture");
        let result = update.update();
        assert!(
            matches!(
                result,
                RefUpdateResult::New | RefUpdateResult::Forced | RefUpdateResult::FastForward
            ),
            "fixture ref update of {name} failed: {result:?}"
        );
    }
}

/// How one object is represented in a synthesized pack.
pub enum PackObjectSpec {
    Plain(ObjectType, Vec<u8>),
    /// Delta against an earlier object in the same pack, by position.
    OfsDelta { base: usize, delta: Vec<u8> },
    /// Delta against an object named by id (must also be in the pack
    /// for the reader to resolve it).
    RefDelta { base: usize, delta: Vec<u8> },
}

/// A synthesized pack on disk plus the ids it contains, in spec order.
pub struct BuiltPack {
    pub pack_path: PathBuf,
    pub ids: Vec<ObjectId>,
}

/// Write `name.pack` and `name.idx` under `pack_dir`.
///
/// Delta results are computed while building so the index carries each
/// object's true id, exactly as a packer would have produced.
pub fn write_pack(pack_dir: &Path, name: &str, specs: &[PackObjectSpec]) -> BuiltPack {
    std::fs::create_dir_all(pack_dir).unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(b"PACK");
    body.write_u32::<BigEndian>(2).unwrap();
    body.write_u32::<BigEndian>(specs.len() as u32).unwrap();

    // resolved (type, payload, id) per object, for delta application
    let mut resolved: Vec<(ObjectType, Vec<u8>, ObjectId)> = Vec::new();
    let mut offsets: Vec<u64> = Vec::new();
    let mut packed_ranges: Vec<(usize, usize)> = Vec::new();

    for spec in specs {
        let offset = body.len() as u64;
        offsets.push(offset);
        let start = body.len();

        match spec {
            PackObjectSpec::Plain(kind, payload) => {
                body.extend(object_header(kind.pack_code(), payload.len() as u64));
                body.extend(deflate(payload));
                resolved.push((*kind, payload.clone(), hash_object(*kind, payload)));
            }
            PackObjectSpec::OfsDelta { base, delta } => {
                let (kind, base_payload, _) = resolved[*base].clone();
                body.extend(object_header(6, delta.len() as u64));
                body.extend(ofs_delta_distance(offset - offsets[*base]));
                body.extend(deflate(delta));
                resolved.push(delta_result(kind, &base_payload, delta, offset));
            }
            PackObjectSpec::RefDelta { base, delta } => {
                let (kind, base_payload, base_id) = resolved[*base].clone();
                body.extend(object_header(7, delta.len() as u64));
                body.extend_from_slice(base_id.as_bytes());
                body.extend(deflate(delta));
                resolved.push(delta_result(kind, &base_payload, delta, offset));
            }
        }
        packed_ranges.push((start, body.len()));
    }

    let trailer: [u8; 20] = Sha1::digest(&body).into();
    let mut pack_bytes = body;
    pack_bytes.extend_from_slice(&trailer);

    let pack_path = pack_dir.join(format!("{name}.pack"));
    std::fs::write(&pack_path, &pack_bytes).unwrap();

    // index v2, column-major, sorted by id
    let mut order: Vec<usize> = (0..specs.len()).collect();
    order.sort_by_key(|&i| *resolved[i].2.as_bytes());

    let mut idx = Vec::new();
    idx.extend_from_slice(&[0xff, b't', b'O', b'c']);
    idx.write_u32::<BigEndian>(2).unwrap();
    for byte in 0..=255u8 {
        let count = resolved
            .iter()
            .filter(|(_, _, id)| id.as_bytes()[0] <= byte)
            .count();
        idx.write_u32::<BigEndian>(count as u32).unwrap();
    }
    for &i in &order {
        idx.extend_from_slice(resolved[i].2.as_bytes());
    }
    for &i in &order {
        let (start, end) = packed_ranges[i];
        let mut crc = flate2::Crc::new();
        crc.update(&pack_bytes[start..end]);
        idx.write_u32::<BigEndian>(crc.sum()).unwrap();
    }
    for &i in &order {
        idx.write_u32::<BigEndian>(offsets[i] as u32).unwrap();
    }
    idx.extend_from_slice(&trailer);
    let idx_digest: [u8; 20] = Sha1::digest(&idx).into();
    idx.extend_from_slice(&idx_digest);
    std::fs::write(pack_dir.join(format!("{name}.idx")), &idx).unwrap();

    BuiltPack {
        pack_path,
        ids: resolved.into_iter().map(|(_, _, id)| id).collect(),
    }
}

/// The canonical object id of `payload` as an object of `kind`.
pub fn hash_object(kind: ObjectType, payload: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", kind, payload.len()).as_bytes());
    hasher.update(payload);
    ObjectId::from_raw(hasher.finalize().into())
}

/// Pack object header: 3-bit type, 4+7+... size varint.
pub fn object_header(type_code: u8, mut size: u64) -> Vec<u8> {
    let mut byte = (type_code << 4) | (size & 0x0f) as u8;
    size >>= 4;
    let mut out = Vec::new();
    while size > 0 {
        out.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(byte);
    out
}

/// OFS_DELTA backward distance: big-endian base-128 with the `+1`
/// disambiguator on continuation bytes.
pub fn ofs_delta_distance(mut distance: u64) -> Vec<u8> {
    let mut out = vec![(distance & 0x7f) as u8];
    distance >>= 7;
    while distance > 0 {
        distance -= 1;
        out.push(0x80 | (distance & 0x7f) as u8);
        distance >>= 7;
    }
    out.reverse();
    out
}

/// Little-endian base-128 varint used inside delta streams.
pub fn delta_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// A delta that replaces the whole content with `literal`.
pub fn insert_only_delta(base_size: u64, literal: &[u8]) -> Vec<u8> {
    let mut delta = delta_varint(base_size);
    delta.extend(delta_varint(literal.len() as u64));
    for chunk in literal.chunks(127) {
        delta.push(chunk.len() as u8);
        delta.extend_from_slice(chunk);
    }
    delta
}

/// A delta that copies `base[..size]` then appends `suffix`.
pub fn copy_then_insert_delta(base_size: u64, copy_size: u64, suffix: &[u8]) -> Vec<u8> {
    let mut delta = delta_varint(base_size);
    delta.extend(delta_varint(copy_size + suffix.len() as u64));

    // copy command with explicit offset 0 and size bytes
    let mut command = 0x80u8;
    let mut operands = Vec::new();
    for shift in 0..3 {
        let byte = ((copy_size >> (8 * shift)) & 0xff) as u8;
        if byte != 0 {
            command |= 0x10 << shift;
            operands.push(byte);
        }
    }
    delta.push(command);
    delta.extend(operands);

    for chunk in suffix.chunks(127) {
        delta.push(chunk.len() as u8);
        delta.extend_from_slice(chunk);
    }
    delta
}

/// Resolve a delta spec to (type, payload, id).
///
/// A deliberately broken delta (corruption tests) cannot be applied;
/// its index id falls back to a hash of the instruction bytes so the
/// pack still indexes, and the test reaches the object by offset.
fn delta_result(
    kind: ObjectType,
    base_payload: &[u8],
    delta_bytes: &[u8],
    offset: u64,
) -> (ObjectType, Vec<u8>, ObjectId) {
    match delta::apply((Path::new("fixture"), offset), base_payload, delta_bytes) {
        Ok(result) => {
            let id = hash_object(kind, &result);
            (kind, result.to_vec(), id)
        }
        Err(_) => (kind, Vec::new(), hash_object(ObjectType::Blob, delta_bytes)),
    }
}

fn deflate(payload: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}
