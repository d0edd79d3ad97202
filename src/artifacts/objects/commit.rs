//! Git commit object
//!
//! Commits tie a tree snapshot into history. The resolver only needs the
//! structural fields: the tree id for `:path` lookups and the parent ids
//! for `^N`/`~N` traversal.
//!
//! ## Format
//!
//! ```text
//! tree <tree-sha>
//! parent <parent-sha>          (zero or more)
//! author <name> <email> <secs> <tz>
//! committer <name> <email> <secs> <tz>
//!
//! <message>
//! ```

use crate::artifacts::objects::object_id::ObjectId;
use anyhow::Context;
use bytes::Bytes;

/// Author, committer, or tagger identity with timestamp.
///
/// Also the identity format of reflog records.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub timestamp: chrono::DateTime<chrono::FixedOffset>,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Identity {
            name: name.into(),
            email: email.into(),
            timestamp: chrono::Local::now().fixed_offset(),
        }
    }

    /// Format as `name <email> secs tz`, the object and reflog encoding.
    pub fn to_wire(&self) -> String {
        format!(
            "{} <{}> {} {}",
            self.name,
            self.email,
            self.timestamp.timestamp(),
            self.timestamp.format("%z")
        )
    }

    /// Parse the `name <email> secs tz` encoding.
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let email_start = value
            .find('<')
            .context("identity is missing '<'")?;
        let email_end = value.find('>').context("identity is missing '>'")?;

        let name = value[..email_start].trim().to_string();
        let email = value[email_start + 1..email_end].to_string();

        let mut tail = value[email_end + 1..].split_whitespace();
        let seconds: i64 = tail
            .next()
            .context("identity is missing a timestamp")?
            .parse()
            .context("identity timestamp is not a number")?;
        let zone = tail.next().context("identity is missing a timezone")?;

        let offset = parse_timezone(zone).context("identity timezone is malformed")?;
        let timestamp = chrono::DateTime::from_timestamp(seconds, 0)
            .context("identity timestamp out of range")?
            .with_timezone(&offset);

        Ok(Identity {
            name,
            email,
            timestamp,
        })
    }
}

fn parse_timezone(zone: &str) -> Option<chrono::FixedOffset> {
    if !zone.is_ascii() || zone.len() != 5 {
        return None;
    }
    let (sign, digits) = zone.split_at(1);
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    let seconds = (hours * 60 + minutes) * 60;
    match sign {
        "+" => chrono::FixedOffset::east_opt(seconds),
        "-" => chrono::FixedOffset::west_opt(seconds),
        _ => None,
    }
}

/// Parsed commit object.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Commit {
    tree_id: ObjectId,
    parents: Vec<ObjectId>,
    author: Identity,
    committer: Identity,
    message: String,
}

impl Commit {
    pub fn new(
        tree_id: ObjectId,
        parents: Vec<ObjectId>,
        author: Identity,
        message: impl Into<String>,
    ) -> Self {
        Commit {
            tree_id,
            parents,
            committer: author.clone(),
            author,
            message: message.into(),
        }
    }

    pub fn tree_id(&self) -> &ObjectId {
        &self.tree_id
    }

    pub fn parents(&self) -> &[ObjectId] {
        &self.parents
    }

    /// The Nth parent, 1-based as in `commit^N`.
    pub fn parent(&self, nth: usize) -> Option<&ObjectId> {
        nth.checked_sub(1).and_then(|i| self.parents.get(i))
    }

    pub fn author(&self) -> &Identity {
        &self.author
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Parse a commit payload (header already stripped).
    pub fn parse(payload: &[u8]) -> anyhow::Result<Commit> {
        let text = std::str::from_utf8(payload).context("commit is not valid UTF-8")?;
        let mut lines = text.lines();

        let tree_line = lines.next().context("commit is missing its tree line")?;
        let tree_id = ObjectId::from_hex(
            tree_line
                .strip_prefix("tree ")
                .context("commit tree line is malformed")?,
        )?;

        let mut parents = Vec::new();
        let mut line = lines.next().context("commit ends before author line")?;
        while let Some(hex) = line.strip_prefix("parent ") {
            parents.push(ObjectId::from_hex(hex)?);
            line = lines.next().context("commit ends before author line")?;
        }

        let author = Identity::parse(
            line.strip_prefix("author ")
                .context("commit author line is malformed")?,
        )?;
        let committer_line = lines.next().context("commit is missing committer")?;
        let committer = Identity::parse(
            committer_line
                .strip_prefix("committer ")
                .context("commit committer line is malformed")?,
        )?;

        // remaining headers (gpgsig, encoding) run until the blank line
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
        }
        let message = lines.collect::<Vec<_>>().join("\n");

        Ok(Commit {
            tree_id,
            parents,
            author,
            committer,
            message,
        })
    }

    /// Serialize to the canonical payload (no object header).
    pub fn to_payload(&self) -> Bytes {
        let mut lines = Vec::new();
        lines.push(format!("tree {}", self.tree_id));
        for parent in &self.parents {
            lines.push(format!("parent {parent}"));
        }
        lines.push(format!("author {}", self.author.to_wire()));
        lines.push(format!("committer {}", self.committer.to_wire()));
        lines.push(String::new());
        lines.push(self.message.clone());
        Bytes::from(lines.join("\n"))
    }
}
