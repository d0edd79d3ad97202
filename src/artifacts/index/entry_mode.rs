use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid index entry mode {0:#o}")]
pub struct InvalidMode(pub u32);

#[derive(Debug, Clone, Copy, Eq, Ord, Default, PartialEq, PartialOrd)]
pub enum FileMode {
    #[default]
    Regular,
    Executable,
}

/// Mode of an index entry.
///
/// The index tracks files, symlinks, and submodule links; directories
/// never appear as entries (they exist implicitly through their files)
/// but the mode is still representable for tree building.
#[derive(Debug, Clone, Copy, Eq, Ord, Default, PartialEq, PartialOrd)]
pub enum EntryMode {
    File(FileMode),
    #[default]
    Directory,
    Symlink,
    GitLink,
}

impl EntryMode {
    /// A regular non-executable file, the common case.
    pub fn default_file() -> Self {
        EntryMode::File(FileMode::Regular)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryMode::File(FileMode::Regular) => "100644",
            EntryMode::File(FileMode::Executable) => "100755",
            EntryMode::Directory => "40000",
            EntryMode::Symlink => "120000",
            EntryMode::GitLink => "160000",
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            EntryMode::File(FileMode::Regular) => 0o100644,
            EntryMode::File(FileMode::Executable) => 0o100755,
            EntryMode::Directory => 0o40000,
            EntryMode::Symlink => 0o120000,
            EntryMode::GitLink => 0o160000,
        }
    }
}

impl TryFrom<u32> for EntryMode {
    type Error = InvalidMode;

    fn try_from(mode: u32) -> Result<Self, InvalidMode> {
        match mode {
            0o100644 => Ok(EntryMode::File(FileMode::Regular)),
            0o100755 => Ok(EntryMode::File(FileMode::Executable)),
            0o40000 => Ok(EntryMode::Directory),
            0o120000 => Ok(EntryMode::Symlink),
            0o160000 => Ok(EntryMode::GitLink),
            other => Err(InvalidMode(other)),
        }
    }
}

impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
