//! The scan pass: incremental offset-tracked tailing and the one-shot
//! whole-file variant.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use kwatch_core::{now_ts, DetectorSet, Event};

use crate::offsets::OffsetStore;
use crate::scan::collect_log_files;

/// Receives classified events as a pass produces them. The server sink
/// persists/broadcasts/alerts; the agent sink batches for reporting.
pub trait EventSink {
    fn emit(&mut self, event: Event);
}

impl<F: FnMut(Event)> EventSink for F {
    fn emit(&mut self, event: Event) {
        self(event)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub files_scanned: usize,
    pub lines_read: u64,
    pub events_emitted: u64,
}

/// Transforms configured log roots into an event stream.
pub struct Tailer {
    detectors: DetectorSet,
    host_id: String,
    offsets: OffsetStore,
}

impl Tailer {
    pub fn new(detectors: DetectorSet, host_id: String, offsets: OffsetStore) -> Self {
        Tailer {
            detectors,
            host_id,
            offsets,
        }
    }

    /// Swap in the detector set for a new config snapshot.
    pub fn set_detectors(&mut self, detectors: DetectorSet) {
        self.detectors = detectors;
    }

    pub fn offsets_mut(&mut self) -> &mut OffsetStore {
        &mut self.offsets
    }

    /// One incremental pass over every candidate file. Offsets advance
    /// in memory; call [`commit_offsets`](Self::commit_offsets) to
    /// persist them (the server does so right after the pass, the agent
    /// either eagerly or after server acknowledgement).
    pub fn run_incremental(&mut self, roots: &[String], sink: &mut dyn EventSink) -> PassStats {
        let mut stats = PassStats::default();
        for path in collect_log_files(roots) {
            // Rotated archives are not tailed incrementally.
            if path.extension().map(|e| e == "gz").unwrap_or(false) {
                continue;
            }
            match self.tail_file(&path, sink) {
                Ok((lines, events)) => {
                    stats.files_scanned += 1;
                    stats.lines_read += lines;
                    stats.events_emitted += events;
                }
                Err(err) => {
                    tracing::debug!(file = %path.display(), %err, "skipping unreadable file");
                }
            }
        }
        stats
    }

    /// One-shot pass: whole files from the beginning, no offsets,
    /// including `.gz` archives.
    pub fn run_oneshot(&mut self, roots: &[String], sink: &mut dyn EventSink) -> PassStats {
        let mut stats = PassStats::default();
        for path in collect_log_files(roots) {
            let result = if path.extension().map(|e| e == "gz").unwrap_or(false) {
                self.scan_gz(&path, sink)
            } else {
                self.scan_plain(&path, sink)
            };
            match result {
                Ok((lines, events)) => {
                    stats.files_scanned += 1;
                    stats.lines_read += lines;
                    stats.events_emitted += events;
                }
                Err(err) => {
                    tracing::debug!(file = %path.display(), %err, "skipping unreadable file");
                }
            }
        }
        stats
    }

    pub fn commit_offsets(&mut self) -> Result<(), crate::TailerError> {
        self.offsets.save()
    }

    fn tail_file(
        &mut self,
        path: &Path,
        sink: &mut dyn EventSink,
    ) -> Result<(u64, u64), std::io::Error> {
        let key = path.to_string_lossy().to_string();
        let size = std::fs::metadata(path)?.len();
        let mut offset = self.offsets.get(&key);
        // Rotation: a saved offset past the current size means the file
        // was replaced; start over.
        if offset > size {
            tracing::info!(file = %key, offset, size, "offset past EOF, rotation assumed");
            offset = 0;
        }

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);

        let mut line_no: u64 = 0;
        let mut events: u64 = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            offset += n as u64;
            line_no += 1;
            let line = String::from_utf8_lossy(&buf);
            events += self.classify_line(line.trim_end_matches(['\n', '\r']), &key, line_no, sink);
        }
        self.offsets.set(&key, offset);
        Ok((line_no, events))
    }

    fn scan_plain(
        &mut self,
        path: &Path,
        sink: &mut dyn EventSink,
    ) -> Result<(u64, u64), std::io::Error> {
        let file = File::open(path)?;
        self.scan_reader(BufReader::new(file), &path.to_string_lossy(), sink)
    }

    fn scan_gz(
        &mut self,
        path: &Path,
        sink: &mut dyn EventSink,
    ) -> Result<(u64, u64), std::io::Error> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(file);
        self.scan_reader(BufReader::new(decoder), &path.to_string_lossy(), sink)
    }

    fn scan_reader<R: Read>(
        &mut self,
        mut reader: BufReader<R>,
        source: &str,
        sink: &mut dyn EventSink,
    ) -> Result<(u64, u64), std::io::Error> {
        let mut line_no: u64 = 0;
        let mut events: u64 = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            line_no += 1;
            let line = String::from_utf8_lossy(&buf);
            events += self.classify_line(line.trim_end_matches(['\n', '\r']), source, line_no, sink);
        }
        Ok((line_no, events))
    }

    pub(crate) fn classify_line(
        &self,
        line: &str,
        source: &str,
        line_no: u64,
        sink: &mut dyn EventSink,
    ) -> u64 {
        if line.is_empty() {
            return 0;
        }
        let mut emitted = 0;
        let detected_at = now_ts();
        for t in self.detectors.classify(line) {
            let event =
                Event::from_detection(t, line, source, line_no, &detected_at, &self.host_id);
            sink.emit(event);
            emitted += 1;
        }
        emitted
    }
}
