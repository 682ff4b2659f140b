//! Ingest pipeline: remote track to container file

use super::binding::UnitSource;
use crate::error::PipelineError;
use std::sync::Arc;
use tapedeck_media::ContainerWriter;
use tokio::sync::Mutex;

/// Writer shared between a pipeline and its session's teardown
pub type SharedWriter = Arc<Mutex<Box<dyn ContainerWriter>>>;

/// Forward units from `source` to `writer` until the stream ends or a write
/// fails. The writer is closed on every exit path. Returns the number of
/// units written.
pub async fn run_ingest<S: UnitSource>(
    mut source: S,
    writer: SharedWriter,
) -> Result<u64, PipelineError> {
    let mut written = 0u64;

    let outcome = loop {
        let unit = match source.read_unit().await {
            Ok(Some(unit)) => unit,
            Ok(None) => break Ok(()),
            Err(e) => break Err(PipelineError::from(e)),
        };

        let mut guard = writer.lock().await;
        if guard.is_closed() {
            // Session teardown got there first
            break Ok(());
        }
        if let Err(e) = guard.write_unit(&unit) {
            break Err(PipelineError::from(e));
        }
        written += 1;
    };

    let closed = writer.lock().await.close();
    outcome?;
    closed?;

    Ok(written)
}
