pub mod commit;
pub mod loader;
pub mod object_id;
pub mod object_type;
pub mod tag;

/// Raw length of an object id in bytes.
pub const OBJECT_ID_LENGTH: usize = 20;

/// Length of an object id formatted as hexadecimal.
pub const OBJECT_ID_HEX_LENGTH: usize = 40;
