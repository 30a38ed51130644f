#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to spawn worker thread `{worker_id}`: {source}")]
    Spawn {
        worker_id: String,
        #[source]
        source: std::io::Error,
    },
}
