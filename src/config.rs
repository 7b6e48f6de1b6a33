//! Engine-wide tunables.
//!
//! Per-call arguments don't scale to a component graph this size, so
//! the named constants this engine needs get gathered into one struct,
//! constructed once by the embedding application and shared read-only
//! by every component.

/// Constructed once and handed to [`crate::client::Client::new`].
#[derive(Debug, Clone)]
pub struct JpipConfig {
    /// Lower bound on `Lmax`, in bytes.
    pub lmax_min_bytes: u64,
    /// Lower bound on `Lmax/R`, in microseconds.
    pub lmax_min_usecs: u64,
    /// Upper bound on `Lmax/R`, in microseconds.
    pub lmax_max_usecs: u64,
    /// `ABANDON_FACTOR` used by the CID scheduler's staleness check.
    pub abandon_factor: u32,
    /// `WINDOW_TARGET` used by the CID scheduler's throttle formula.
    pub window_target: u32,
    /// Maximum number of abandon gaps carried in one `abandon=` field.
    pub max_abandon_gaps: usize,
    /// Maximum size of the HTTP reply header block we'll buffer.
    pub max_header_bytes: usize,
    /// Reject any hex-encoded name at or above this size.
    pub max_name_bytes: usize,
    /// Per-request cap on emitted cache-model statement bytes.
    pub model_statement_byte_limit: usize,
    /// Simulated per-byte UDP loss probability. Zero (default) disables
    /// loss simulation.
    pub aux_per_byte_loss_probability: f64,
    /// Simulated minimum microseconds-per-byte throttle on the aux
    /// receive path. Zero (default) disables throttling.
    pub aux_min_usecs_per_byte: f64,
}

impl Default for JpipConfig {
    fn default() -> JpipConfig {
        JpipConfig {
            lmax_min_bytes: 2048,
            lmax_min_usecs: 500_000,
            lmax_max_usecs: 5_000_000,
            abandon_factor: 3,
            window_target: 15,
            max_abandon_gaps: 128,
            max_header_bytes: 16384,
            max_name_bytes: 64 * 1024,
            model_statement_byte_limit: 16_000,
            aux_per_byte_loss_probability: 0.0,
            aux_min_usecs_per_byte: 0.0,
        }
    }
}
