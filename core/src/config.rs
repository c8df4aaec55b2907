use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// In-memory queue in front of each backing stream of the reorder buffer.
    pub queue_buffer_size: usize,
    /// Chunk used when draining or compacting the scratch file.
    pub copy_buffer_size: usize,
    pub progress_interval_bytes: u64,
    /// Scratch size at which the reorder buffer tries to drain into the primary stream.
    pub aux_threshold_bytes: u64,
    pub segment_report_interval_bytes: u64,
    pub unique_name_attempts: u32,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            queue_buffer_size: 8 * 1024,
            copy_buffer_size: 128 * 1024,
            progress_interval_bytes: 64 * 1024,
            aux_threshold_bytes: 15 * 1024 * 1024,
            segment_report_interval_bytes: 256 * 1024,
            unique_name_attempts: 1000,
        }
    }
}
