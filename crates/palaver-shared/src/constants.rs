/// Length of the rolling quota window in hours
pub const QUOTA_WINDOW_HOURS: i64 = 24;

/// Length of the over-limit period in hours
pub const OVER_LIMIT_PERIOD_HOURS: i64 = 24;

/// Storage bucket for files uploaded by users
pub const BUCKET_USER_FILES: &str = "user-files";

/// Storage bucket for images produced by the image generation tool
pub const BUCKET_GENERATED_IMAGES: &str = "generated-images";

/// Storage bucket for documents produced by the file generation tool
pub const BUCKET_GENERATED_FILES: &str = "generated-files";

/// Path prefix under which public objects are served
pub const PUBLIC_OBJECT_PREFIX: &str = "/storage/v1/object/public";

/// Maximum upload size in bytes (10 MiB)
pub const MAX_UPLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Longest chat title derived from a first message
pub const MAX_CHAT_TITLE_CHARS: usize = 80;

/// Most tokens a single posted message may report
pub const MAX_REPORTED_TOKENS: i64 = 10_000_000;

/// Key derivation context for hashed storage path segments (BLAKE3)
pub const KDF_CONTEXT_STORAGE_PATH: &str = "palaver-storage-path-v1";

/// Default page size when listing chats
pub const DEFAULT_CHAT_PAGE_SIZE: u32 = 50;
