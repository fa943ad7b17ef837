//! Size limits and retry budgets
//!
//! These limits are enforced by the engine. Violations of size limits are
//! client errors and are never retried.

use crate::error::{VellumError, VellumResult};

/// Largest blob that may be kept inline in a document (1 MiB)
///
/// Anything bigger must use the `stored` placement.
pub const NON_STORED_SIZE_LIMIT: usize = 1024 * 1024;

/// Attempts a single-document write makes before a soft conflict is fatal
pub const CONFLICT_RETRIES: usize = 10;

/// Attempts a read makes when the shard is modified underneath it
pub const DB_RETRIES: usize = 3;

/// Reject inline payloads above [`NON_STORED_SIZE_LIMIT`]
pub fn validate_inline_size(blob: &[u8]) -> VellumResult<()> {
    if blob.len() > NON_STORED_SIZE_LIMIT {
        return Err(VellumError::client(format!(
            "Non-stored object has a size limit of {} bytes, got {}",
            NON_STORED_SIZE_LIMIT,
            blob.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_limit_is_inclusive() {
        let exact = vec![0u8; NON_STORED_SIZE_LIMIT];
        assert!(validate_inline_size(&exact).is_ok());

        let over = vec![0u8; NON_STORED_SIZE_LIMIT + 1];
        let err = validate_inline_size(&over).unwrap_err();
        assert!(err.is_client());
    }

    #[test]
    fn test_empty_blob_is_fine() {
        assert!(validate_inline_size(&[]).is_ok());
    }
}
