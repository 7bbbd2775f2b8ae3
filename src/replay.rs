use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::ingest::SampleFeed;
use crate::types::RawSample;

/// Samples decoded from a recording, plus how many lines could not be decoded.
#[derive(Debug, Default)]
pub struct Recording {
    pub samples: Vec<RawSample>,
    pub undecodable_lines: usize,
}

/// Parse newline-delimited JSON samples. Blank lines are skipped.
pub fn parse_recording(reader: impl BufRead) -> Result<Recording> {
    let mut recording = Recording::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawSample>(line) {
            Ok(sample) => recording.samples.push(sample),
            Err(e) => {
                log::warn!("line {}: undecodable sample: {e}", index + 1);
                recording.undecodable_lines += 1;
            }
        }
    }
    Ok(recording)
}

/// Load a `.jsonl` recording, decompressing `.gz` files.
pub fn load_recording(path: &Path) -> Result<Recording> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    parse_recording(BufReader::new(reader))
}

/// Publish a recording to the feed, pausing `pace` between samples.
/// Returns the number of samples published.
pub async fn replay_loop(
    recording: Recording,
    feed: SampleFeed,
    pace: Duration,
    cancel_token: CancellationToken,
) -> usize {
    let total = recording.samples.len();
    let mut published = 0usize;

    for sample in recording.samples {
        if cancel_token.is_cancelled() {
            break;
        }
        if feed.publish(sample) {
            published += 1;
        }
        if !pace.is_zero() {
            tokio::select! {
                _ = sleep(pace) => {}
                _ = cancel_token.cancelled() => break,
            }
        } else {
            tokio::task::yield_now().await;
        }
    }

    log::info!("replay finished: {published}/{total} samples published");
    published
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    const LOG: &str = r#"{"machine_id":1,"timestamp":"2025-03-01T08:00:00Z","ax":2000.0,"ay":0.0,"az":0.0}

{"machine_id":1,"timestamp":"2025-03-01T08:00:01Z","ax":1.0,"ay":0.0}
not json
{"machine_id":2,"timestamp":"2025-03-01T08:00:01Z","ax":0.0,"ay":0.0,"az":0.0}
"#;

    #[test]
    fn test_parse_recording_counts_bad_lines() {
        let recording = parse_recording(Cursor::new(LOG)).unwrap();
        // Missing axis still decodes; the interpreter rejects it later.
        assert_eq!(recording.samples.len(), 3);
        assert_eq!(recording.samples[1].az, None);
        assert_eq!(recording.undecodable_lines, 1);
    }

    #[test]
    fn test_load_gzip_recording() {
        let dir = std::env::temp_dir().join(format!("machine_monitor_replay_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("samples.jsonl.gz");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(LOG.as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let recording = load_recording(&path).unwrap();
        assert_eq!(recording.samples.len(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_replay_publishes_to_subscriber() {
        let feed = SampleFeed::new(16);
        let mut rx = feed.subscribe();
        let recording = parse_recording(Cursor::new(LOG)).unwrap();

        let published = replay_loop(recording, feed, Duration::ZERO, CancellationToken::new()).await;
        assert_eq!(published, 3);
        assert_eq!(rx.recv().await.unwrap().machine_id, 1);
    }
}
