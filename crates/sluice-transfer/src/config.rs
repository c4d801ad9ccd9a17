use std::str::FromStr;

/// Bytes moved per read/write step (1 MB).
pub const DEFAULT_TRANSFER_UNIT: usize = 1024 * 1024;

/// Cap on frames, and therefore on concurrent connections, per file.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Files are not split below this frame size (10 MB).
pub const DEFAULT_MIN_FRAME_SIZE: u64 = 10 * 1024 * 1024;

/// Well-known port of the bulk transfer service.
pub const DEFAULT_TRANSFER_PORT: u16 = 6669;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub transfer_unit_size: usize,
    pub max_connections: usize,
    pub min_frame_size: u64,
    pub port: u16,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            transfer_unit_size: DEFAULT_TRANSFER_UNIT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_frame_size: DEFAULT_MIN_FRAME_SIZE,
            port: DEFAULT_TRANSFER_PORT,
        }
    }
}

impl TransferConfig {
    /// Read overrides from `SLUICE_*` variables. Missing, unparsable or zero
    /// values keep the default.
    pub fn from_env() -> Self {
        Self {
            transfer_unit_size: env_or("SLUICE_TRANSFER_UNIT", DEFAULT_TRANSFER_UNIT),
            max_connections: env_or("SLUICE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            min_frame_size: env_or("SLUICE_MIN_FRAME_SIZE", DEFAULT_MIN_FRAME_SIZE),
            port: env_or("SLUICE_TRANSFER_PORT", DEFAULT_TRANSFER_PORT),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Default + PartialEq,
{
    parse_or(std::env::var(key).ok().as_deref(), default)
}

fn parse_or<T>(raw: Option<&str>, default: T) -> T
where
    T: FromStr + Default + PartialEq,
{
    raw.and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v != T::default())
        .unwrap_or(default)
}
