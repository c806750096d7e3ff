//! Materialized-path helpers.
//!
//! A node's path is `<parent.path>/<index>` with a fixed-width 2-digit
//! sibling index starting at 1 (`01`, `01/01`, `01/02/11`, ...). Fixed
//! width keeps lexicographic order equal to sibling order, so ancestor,
//! descendant and "rightmost" queries need no recursion.

use crate::contract::TreeStoreError;

/// Sibling index field width (digits).
pub const SEGMENT_WIDTH: usize = 2;

/// Maximum children under one parent, bounded by the field width.
pub const MAX_SIBLINGS: u32 = 99;

/// Compose a child path from the parent's path and a 1-based sibling
/// index. Fails `Conflict` past [`MAX_SIBLINGS`].
pub fn child_path(parent_path: Option<&str>, index: u32) -> Result<String, TreeStoreError> {
    if index == 0 || index > MAX_SIBLINGS {
        return Err(TreeStoreError::Conflict(format!(
            "sibling index {index} out of range 1..={MAX_SIBLINGS}"
        )));
    }
    let segment = format!("{index:02}");
    Ok(match parent_path {
        Some(parent) => format!("{parent}/{segment}"),
        None => segment,
    })
}

/// Parse the sibling index (last segment) out of a path.
pub fn sibling_index(path: &str) -> Option<u32> {
    path.rsplit('/').next()?.parse().ok()
}
