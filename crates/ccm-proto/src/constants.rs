/// CCM protocol and system constants.

/// Internal CCM protocol version.
pub const CCM_PROTO_VER: u8 = 1;

/// Oldest protocol version this daemon still understands.
pub const CCM_PROTO_VER_MIN: u8 = 1;

/// Maximum nodes in a cluster. Node UUIDs are directory indices
/// in `[0, MAXNODE)`.
pub const MAXNODE: usize = 64;

/// Bytes backing a membership bitmap.
pub const BITMAP_BYTES: usize = MAXNODE / 8;

/// Length of the hex wire form of a membership bitmap.
pub const BITMAP_WIRE_LEN: usize = BITMAP_BYTES * 2;

/// Length of a partition cookie in characters.
///
/// Cookies are drawn from the printable ASCII range `'!'..='~'` and are
/// never empty; two partitions generating cookies independently must not
/// collide in practice.
pub const COOKIE_LEN: usize = 14;

/// Default listen port for cluster communication.
pub const CCM_LISTEN_PORT: u16 = 7400;
