/// Maximum length of a client name on a booking.
pub const MAX_NAME_LEN: usize = 200;

/// Maximum length of the free-form client contact field.
pub const MAX_CONTACT_LEN: usize = 320;

/// Maximum number of services in a catalog file.
pub const MAX_SERVICES: usize = 1_000;

/// Maximum intervals in a single weekday template.
pub const MAX_INTERVALS_PER_DAY: usize = 48;

/// Smallest and largest accepted slot width in minutes.
pub const MIN_SLOT_MINUTES: u16 = 5;
pub const MAX_SLOT_MINUTES: u16 = 240;

/// Upper bound on concurrently held leases across all sessions.
pub const MAX_ACTIVE_LEASES: usize = 100_000;

/// Inbound WebSocket frames larger than this are dropped.
pub const MAX_INBOUND_FRAME_LEN: usize = 4 * 1024;
