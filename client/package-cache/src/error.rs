use dsc_common::ContentFingerprint;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No blob with the requested fingerprint.
    #[error("blob not found")]
    NotFound,
    /// Deletion refused while readers are outstanding.
    #[error("blob in use by {readers} readers")]
    InUse { readers: usize },
    /// Ingested bytes did not hash to the expected fingerprint. The
    /// cache is left unchanged.
    #[error("content hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        expected: ContentFingerprint,
        computed: ContentFingerprint,
    },
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}
