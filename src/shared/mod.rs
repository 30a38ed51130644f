pub mod cancel;
pub mod ids;
pub mod idempotency;
pub mod time;

pub use cancel::CancellationToken;
pub use ids::{generate_run_id, RunId};
pub use idempotency::compute_idempotency_key;
