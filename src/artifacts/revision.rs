//! Revision expressions
//!
//! Parses and evaluates the textual names callers use for objects:
//! `HEAD`, `master~3:foo/bar`, `abc1234^{tree}`, `v1.0^{}`,
//! `topic@{2}`. Parsing is a left fold: a prefix term (ref name, hex
//! id, or the implicit HEAD of `:path` and `@{...}`), then suffix
//! operators applied left to right.
//!
//! Evaluation distinguishes three outcomes: an id, `None` for an
//! expression that names nothing (unknown ref, missing tree path), and
//! errors for ambiguity, type mismatches, and I/O.

use crate::areas::reflog::Reflog;
use crate::areas::repository::Repository;
use crate::artifacts::objects::commit::Commit;
use crate::artifacts::objects::object_id::{AbbreviatedObjectId, ObjectId};
use crate::artifacts::objects::object_type::ObjectType;
use crate::artifacts::objects::tag::Tag;
use crate::artifacts::objects::OBJECT_ID_HEX_LENGTH;
use crate::artifacts::tree;
use anyhow::Context;
use bytes::Bytes;
use thiserror::Error;

/// Ref alias: `@` alone names HEAD.
const HEAD: &str = "HEAD";

/// Minimum hex length treated as an object id abbreviation.
const MIN_ABBREV: usize = 4;

/// Pattern of `git describe` output: the trailing `-g<hex>` names the id.
const DESCRIBE_SUFFIX: &str = r"-g([0-9a-f]{4,40})$";

/// A peel requested a type the object cannot provide.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("object {id} is a {found}, not a {expected}")]
pub struct IncorrectObjectType {
    pub id: ObjectId,
    pub found: ObjectType,
    pub expected: ObjectType,
}

/// How a reflog position is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflogSpec {
    /// `name@{N}`: N moves back from the newest entry.
    Nth(usize),
    /// `name@{<date>}`: the value the ref had at that time.
    Date(chrono::DateTime<chrono::FixedOffset>),
}

/// Parsed revision expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// A ref name, full hex id, abbreviation, or describe output.
    Name(String),
    /// `R^N`; `R^` is `R^1` and `R^0` peels to the commit itself.
    Parent(Box<Revision>, usize),
    /// `R~N`: Nth first-parent ancestor.
    Ancestor(Box<Revision>, usize),
    /// `R^{commit|tree|blob|tag}`.
    Peel(Box<Revision>, ObjectType),
    /// `R^{}`: strip annotated-tag layers.
    PeelTag(Box<Revision>),
    /// `R:path`; empty path names the tree itself.
    TreePath(Box<Revision>, String),
    /// `R@{N}` / `R@{date}`.
    Reflog(Box<Revision>, ReflogSpec),
}

impl Revision {
    /// Parse an expression into its operator tree.
    pub fn parse(expression: &str) -> anyhow::Result<Revision> {
        if expression.is_empty() {
            anyhow::bail!("empty revision expression");
        }

        let bytes = expression.as_bytes();
        let mut prefix_end = bytes.len();
        let mut position = 0;
        while position < bytes.len() {
            match bytes[position] {
                b'^' | b'~' | b':' => {
                    prefix_end = position;
                    break;
                }
                b'@' if bytes.get(position + 1) == Some(&b'{') => {
                    prefix_end = position;
                    break;
                }
                _ => position += 1,
            }
        }

        let prefix = &expression[..prefix_end];
        let mut revision = match prefix {
            "" | "@" => Revision::Name(HEAD.to_string()),
            name => Revision::Name(name.to_string()),
        };

        let mut rest = &expression[prefix_end..];
        while !rest.is_empty() {
            let rest_bytes = rest.as_bytes();
            match rest_bytes[0] {
                b':' => {
                    revision = Revision::TreePath(Box::new(revision), rest[1..].to_string());
                    rest = "";
                }
                b'~' => {
                    let (count, used) = leading_number(&rest[1..]);
                    revision = Revision::Ancestor(Box::new(revision), count.unwrap_or(1));
                    rest = &rest[1 + used..];
                }
                b'^' => {
                    if rest_bytes.get(1) == Some(&b'{') {
                        let close = rest
                            .find('}')
                            .context("unterminated ^{...} in revision expression")?;
                        let kind = &rest[2..close];
                        revision = match kind {
                            "" => Revision::PeelTag(Box::new(revision)),
                            _ => Revision::Peel(
                                Box::new(revision),
                                ObjectType::try_from(kind).map_err(|_| {
                                    anyhow::anyhow!("unsupported peel target {kind:?}")
                                })?,
                            ),
                        };
                        rest = &rest[close + 1..];
                    } else {
                        let (count, used) = leading_number(&rest[1..]);
                        revision = Revision::Parent(Box::new(revision), count.unwrap_or(1));
                        rest = &rest[1 + used..];
                    }
                }
                b'@' => {
                    // the prefix scan guarantees a '{' follows
                    let close = rest
                        .find('}')
                        .context("unterminated @{...} in revision expression")?;
                    let spec = parse_reflog_spec(&rest[2..close])?;
                    revision = Revision::Reflog(Box::new(revision), spec);
                    rest = &rest[close + 1..];
                }
                other => {
                    anyhow::bail!("unexpected {:?} in revision expression", other as char)
                }
            }
        }

        Ok(revision)
    }

    /// Evaluate against a repository.
    pub fn resolve(&self, repository: &Repository) -> anyhow::Result<Option<ObjectId>> {
        match self {
            Revision::Name(name) => resolve_name(repository, name),

            Revision::Parent(base, nth) => {
                let Some(id) = base.resolve(repository)? else {
                    return Ok(None);
                };
                let commit_id = peel_to_commit(repository, id)?;
                if *nth == 0 {
                    return Ok(Some(commit_id));
                }
                let commit = parse_commit(repository, &commit_id)?;
                Ok(commit.parent(*nth).copied())
            }

            Revision::Ancestor(base, generations) => {
                let Some(id) = base.resolve(repository)? else {
                    return Ok(None);
                };
                let mut current = peel_to_commit(repository, id)?;
                for _ in 0..*generations {
                    let commit = parse_commit(repository, &current)?;
                    match commit.parent(1) {
                        Some(parent) => current = *parent,
                        None => return Ok(None),
                    }
                }
                Ok(Some(current))
            }

            Revision::Peel(base, expected) => {
                let Some(id) = base.resolve(repository)? else {
                    return Ok(None);
                };
                // `^{tree}` dereferences commits to their trees; the
                // other kinds only strip tag layers
                if *expected == ObjectType::Tree {
                    return peel_to_tree(repository, id).map(Some);
                }
                let mut id = id;
                loop {
                    let (found, payload) = load(repository, &id)?;
                    if found == *expected {
                        return Ok(Some(id));
                    }
                    if found != ObjectType::Tag {
                        return Err(IncorrectObjectType {
                            id,
                            found,
                            expected: *expected,
                        }
                        .into());
                    }
                    id = *Tag::parse(&payload)?.object_id();
                }
            }

            Revision::PeelTag(base) => {
                let Some(mut id) = base.resolve(repository)? else {
                    return Ok(None);
                };
                loop {
                    let (found, payload) = load(repository, &id)?;
                    if found != ObjectType::Tag {
                        return Ok(Some(id));
                    }
                    id = *Tag::parse(&payload)?.object_id();
                }
            }

            Revision::TreePath(base, path) => {
                let Some(id) = base.resolve(repository)? else {
                    return Ok(None);
                };
                let tree_id = peel_to_tree(repository, id)?;
                if path.is_empty() {
                    return Ok(Some(tree_id));
                }

                let reader = repository.new_reader();
                let root = reader.open_as(&tree_id, ObjectType::Tree)?;
                let load_tree =
                    |wanted: &ObjectId| reader.open_as(wanted, ObjectType::Tree);
                Ok(tree::lookup_path(load_tree, root, path)?.map(|entry| entry.id))
            }

            Revision::Reflog(base, spec) => {
                let Revision::Name(name) = base.as_ref() else {
                    anyhow::bail!("reflog lookup requires a ref name");
                };
                let Some(full_name) = full_ref_name(repository, name)? else {
                    return Ok(None);
                };

                let log = Reflog::for_ref(repository.git_dir(), &full_name);
                let entry = match spec {
                    ReflogSpec::Nth(nth) => log.read(*nth)?,
                    ReflogSpec::Date(when) => log.entry_at(*when)?,
                };
                Ok(entry.map(|entry| entry.new_id))
            }
        }
    }
}

/// Parse an optional decimal run; returns (value, chars consumed).
fn leading_number(text: &str) -> (Option<usize>, usize) {
    let digits = text.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        (None, 0)
    } else {
        (text[..digits].parse().ok(), digits)
    }
}

/// `@{...}` content: a step count or a timestamp.
fn parse_reflog_spec(content: &str) -> anyhow::Result<ReflogSpec> {
    if content.is_empty() {
        anyhow::bail!("empty @{{}} in revision expression");
    }
    if content.bytes().all(|byte| byte.is_ascii_digit()) {
        return Ok(ReflogSpec::Nth(content.parse()?));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(content, format) {
            return Ok(ReflogSpec::Date(naive.and_utc().fixed_offset()));
        }
    }
    if let Ok(when) = chrono::DateTime::parse_from_rfc3339(content) {
        return Ok(ReflogSpec::Date(when));
    }
    anyhow::bail!("unsupported @{{...}} specification {content:?}")
}

/// Resolve a bare name: ref search order first, then hex forms, then the
/// describe-output fallback.
fn resolve_name(repository: &Repository, name: &str) -> anyhow::Result<Option<ObjectId>> {
    if let Some(reference) = repository.ref_database().find_ref(name)? {
        return repository
            .ref_database()
            .resolve(&reference)
            .map(|leaf| leaf.and_then(|leaf| leaf.object_id().copied()));
    }

    let is_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit());
    if name.len() == OBJECT_ID_HEX_LENGTH && is_hex(name) {
        // a literal id does not require the object to exist
        return Ok(Some(ObjectId::from_hex(name)?));
    }
    if name.len() >= MIN_ABBREV && name.len() < OBJECT_ID_HEX_LENGTH && is_hex(name) {
        let abbrev = AbbreviatedObjectId::from_hex(name)?;
        let token = crate::artifacts::core::CancelToken::none();
        return repository.object_database().resolve(&abbrev, &token);
    }

    let describe = regex::Regex::new(DESCRIBE_SUFFIX).expect("describe pattern compiles");
    if let Some(captures) = describe.captures(name) {
        let abbrev = AbbreviatedObjectId::from_hex(&captures[1])?;
        let token = crate::artifacts::core::CancelToken::none();
        return repository.object_database().resolve(&abbrev, &token);
    }

    Ok(None)
}

/// Expand a short name to the full ref name for reflog lookup.
fn full_ref_name(repository: &Repository, name: &str) -> anyhow::Result<Option<String>> {
    Ok(repository
        .ref_database()
        .find_ref(name)?
        .map(|reference| reference.name().to_string()))
}

fn load(repository: &Repository, id: &ObjectId) -> anyhow::Result<(ObjectType, Bytes)> {
    let loader = repository.new_reader().open(id)?;
    let kind = loader.kind();
    let bytes = loader.cached_bytes()?;
    Ok((kind, bytes))
}

fn parse_commit(repository: &Repository, id: &ObjectId) -> anyhow::Result<Commit> {
    let payload = repository.new_reader().open_as(id, ObjectType::Commit)?;
    Commit::parse(&payload)
}

/// Chase annotated tags until a commit.
fn peel_to_commit(repository: &Repository, mut id: ObjectId) -> anyhow::Result<ObjectId> {
    loop {
        let (found, payload) = load(repository, &id)?;
        match found {
            ObjectType::Commit => return Ok(id),
            ObjectType::Tag => id = *Tag::parse(&payload)?.object_id(),
            other => {
                return Err(IncorrectObjectType {
                    id,
                    found: other,
                    expected: ObjectType::Commit,
                }
                .into())
            }
        }
    }
}

/// Chase tags and commits down to a tree.
fn peel_to_tree(repository: &Repository, mut id: ObjectId) -> anyhow::Result<ObjectId> {
    loop {
        let (found, payload) = load(repository, &id)?;
        match found {
            ObjectType::Tree => return Ok(id),
            ObjectType::Commit => return Ok(*Commit::parse(&payload)?.tree_id()),
            ObjectType::Tag => id = *Tag::parse(&payload)?.object_id(),
            other => {
                return Err(IncorrectObjectType {
                    id,
                    found: other,
                    expected: ObjectType::Tree,
                }
                .into())
            }
        }
    }
}
