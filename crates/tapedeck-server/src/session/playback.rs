//! Playback pipeline: container file to local track

use super::binding::UnitSink;
use super::state::ConnectedSignal;
use crate::error::PipelineError;
use std::time::Duration;
use tapedeck_media::{ContainerReader, Pacer};

/// Replay every unit of `reader` into `sink` once the peer has connected.
///
/// Each unit is followed by a wait of its own duration (zero durations use
/// `fallback`). End of data stops cleanly and leaves the track open. Returns
/// the number of units sent.
pub async fn run_playback<R, S>(
    mut reader: R,
    sink: &S,
    connected: &ConnectedSignal,
    connect_timeout: Duration,
    fallback: Duration,
) -> Result<u64, PipelineError>
where
    R: ContainerReader,
    S: UnitSink + ?Sized,
{
    connected.wait(connect_timeout).await?;

    let mut pacer = Pacer::new(fallback);
    let mut sent = 0u64;

    while let Some(mut unit) = reader.next_unit()? {
        unit.duration = pacer.effective_duration(unit.duration);
        sink.write_unit(&unit).await?;
        sent += 1;
        pacer.wait(unit.duration).await;
    }

    tracing::debug!("Playback reached end of data after {} units", sent);
    Ok(sent)
}
