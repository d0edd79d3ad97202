//! Annotated tag object
//!
//! An annotated tag wraps another object with a name, tagger, and message.
//! Peeling (`ref^{}`, `tag^{commit}`) follows the `object` header, chasing
//! nested tags until a non-tag object is reached.
//!
//! ## Format
//!
//! ```text
//! object <sha>
//! type <commit|tree|blob|tag>
//! tag <name>
//! tagger <name> <email> <secs> <tz>
//!
//! <message>
//! ```

use crate::artifacts::objects::commit::Identity;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use anyhow::Context;
use bytes::Bytes;

/// Parsed annotated tag.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Tag {
    object_id: ObjectId,
    object_type: ObjectType,
    name: String,
    tagger: Option<Identity>,
    message: String,
}

impl Tag {
    pub fn new(
        object_id: ObjectId,
        object_type: ObjectType,
        name: impl Into<String>,
        tagger: Identity,
        message: impl Into<String>,
    ) -> Self {
        Tag {
            object_id,
            object_type,
            name: name.into(),
            tagger: Some(tagger),
            message: message.into(),
        }
    }

    /// The tagged object.
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// Declared type of the tagged object.
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tagger(&self) -> Option<&Identity> {
        self.tagger.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Parse a tag payload (header already stripped).
    pub fn parse(payload: &[u8]) -> anyhow::Result<Tag> {
        let text = std::str::from_utf8(payload).context("tag is not valid UTF-8")?;
        let mut lines = text.lines();

        let object_line = lines.next().context("tag is missing its object line")?;
        let object_id = ObjectId::from_hex(
            object_line
                .strip_prefix("object ")
                .context("tag object line is malformed")?,
        )?;

        let type_line = lines.next().context("tag is missing its type line")?;
        let object_type = ObjectType::try_from(
            type_line
                .strip_prefix("type ")
                .context("tag type line is malformed")?,
        )?;

        let name_line = lines.next().context("tag is missing its tag line")?;
        let name = name_line
            .strip_prefix("tag ")
            .context("tag name line is malformed")?
            .to_string();

        // tagger is optional in very old tags
        let mut tagger = None;
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            if let Some(identity) = line.strip_prefix("tagger ") {
                tagger = Some(Identity::parse(identity)?);
            }
        }
        let message = lines.collect::<Vec<_>>().join("\n");

        Ok(Tag {
            object_id,
            object_type,
            name,
            tagger,
            message,
        })
    }

    /// Serialize to the canonical payload (no object header).
    pub fn to_payload(&self) -> Bytes {
        let mut lines = Vec::new();
        lines.push(format!("object {}", self.object_id));
        lines.push(format!("type {}", self.object_type));
        lines.push(format!("tag {}", self.name));
        if let Some(tagger) = &self.tagger {
            lines.push(format!("tagger {}", tagger.to_wire()));
        }
        lines.push(String::new());
        lines.push(self.message.clone());
        Bytes::from(lines.join("\n"))
    }
}
