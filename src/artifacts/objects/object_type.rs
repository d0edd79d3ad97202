use std::io::BufRead;
use thiserror::Error;

/// The four storable object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

/// Raised when a type tag cannot be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid object type: {0:?}")]
    InvalidName(String),
    #[error("invalid pack object type code: {0}")]
    InvalidPackCode(u8),
}

impl ObjectType {
    /// The textual tag used in loose-object headers and `cat-file`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::Tree => "tree",
            ObjectType::Blob => "blob",
            ObjectType::Tag => "tag",
        }
    }

    /// The 3-bit type code used in pack object headers.
    pub fn pack_code(&self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
        }
    }

    /// Decode a non-delta 3-bit pack type code.
    ///
    /// Codes 6 (OFS_DELTA) and 7 (REF_DELTA) are representations, not
    /// object kinds, and are rejected here; the pack reader handles them
    /// before asking for a type.
    pub fn from_pack_code(code: u8) -> Result<ObjectType, TypeError> {
        match code {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::Tag),
            other => Err(TypeError::InvalidPackCode(other)),
        }
    }

    /// Parse the `"<type> <size>\0"` header of an inflated loose object.
    ///
    /// # Returns
    ///
    /// The object type and the declared payload size.
    pub fn parse_header(reader: &mut impl BufRead) -> anyhow::Result<(ObjectType, u64)> {
        let mut type_bytes = Vec::new();
        reader.read_until(b' ', &mut type_bytes)?;
        if type_bytes.pop() != Some(b' ') {
            anyhow::bail!("truncated object header");
        }

        let type_name = String::from_utf8(type_bytes)?;
        let object_type = ObjectType::try_from(type_name.as_str())?;

        let mut size_bytes = Vec::new();
        reader.read_until(b'\0', &mut size_bytes)?;
        if size_bytes.pop() != Some(b'\0') {
            anyhow::bail!("truncated object header");
        }
        let size = std::str::from_utf8(&size_bytes)?
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("invalid object size in header"))?;

        Ok((object_type, size))
    }
}

impl TryFrom<&str> for ObjectType {
    type Error = TypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "commit" => Ok(ObjectType::Commit),
            "tree" => Ok(ObjectType::Tree),
            "blob" => Ok(ObjectType::Blob),
            "tag" => Ok(ObjectType::Tag),
            other => Err(TypeError::InvalidName(other.to_string())),
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ObjectType::Commit, "commit", 1)]
    #[case(ObjectType::Tree, "tree", 2)]
    #[case(ObjectType::Blob, "blob", 3)]
    #[case(ObjectType::Tag, "tag", 4)]
    fn test_tags_round_trip(#[case] kind: ObjectType, #[case] name: &str, #[case] code: u8) {
        assert_eq!(kind.as_str(), name);
        assert_eq!(ObjectType::try_from(name).unwrap(), kind);
        assert_eq!(kind.pack_code(), code);
        assert_eq!(ObjectType::from_pack_code(code).unwrap(), kind);
    }

    #[rstest]
    #[case(6)]
    #[case(7)]
    #[case(0)]
    fn test_delta_codes_are_not_object_kinds(#[case] code: u8) {
        assert_eq!(
            ObjectType::from_pack_code(code),
            Err(TypeError::InvalidPackCode(code))
        );
    }

    #[test]
    fn test_parse_header() {
        let mut reader = std::io::Cursor::new(b"blob 1234\0payload".to_vec());
        let (kind, size) = ObjectType::parse_header(&mut reader).unwrap();
        assert_eq!(kind, ObjectType::Blob);
        assert_eq!(size, 1234);
    }

    #[test]
    fn test_parse_header_rejects_unknown_type() {
        let mut reader = std::io::Cursor::new(b"blobby 12\0".to_vec());
        assert!(ObjectType::parse_header(&mut reader).is_err());
    }

    #[test]
    fn test_parse_header_rejects_truncation() {
        let mut reader = std::io::Cursor::new(b"blob 12".to_vec());
        assert!(ObjectType::parse_header(&mut reader).is_err());
    }
}
