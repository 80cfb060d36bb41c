/// Application-wide constants
/// All magic numbers and constant values should be defined here

/// Default maximum upload size in megabytes
pub const DEFAULT_MAX_UPLOAD_MB: usize = 50;

/// Extra room for multipart boundaries and headers on top of the file itself
pub const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Emoji sequence used in logs
pub const PANOVIEW_EMOJI: &str = "🌐📷";

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// AES block / CBC IV length in bytes
pub const IV_LEN: usize = 16;

/// Storage namespace every upload lands under
pub const STORAGE_NAMESPACE: &str = "3d-views";

/// Path segment of shareable links
pub const VIEW_PREFIX: &str = "/view";

/// Path prefix proxied to the object store
pub const PROXY_PREFIX: &str = "/3d";

/// Default public base of canonical storage URLs
pub const DEFAULT_STORAGE_PUBLIC_URL: &str = "https://storage.panoview.local/bucket";

/// Longest original file name kept in a storage path
pub const MAX_FILE_NAME_LEN: usize = 120;
