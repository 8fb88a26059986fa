//! Feature-usage flags collected by the host diagnostics pipeline.

use std::path::Path;

use tracing::debug;

use crate::Error;

pub const AWS_MULTIPLE_VIPS: &str = "aws_multiple_vips";

/// Records whether the cluster uses more than one VIP, judged by the pair
/// map size after an update.
pub fn set_multiple_vips_flag(path: &Path, pair_count: usize) -> Result<(), Error> {
    debug!(
        "Updating {} with multiple vips feature status",
        path.display()
    );
    let value = if pair_count > 1 { 1 } else { 0 };
    crate::update_json_file(path, AWS_MULTIPLE_VIPS, serde_json::json!(value))
}
