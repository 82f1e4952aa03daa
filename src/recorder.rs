// src/recorder.rs
//
// Event persistence: an append-only JSON-lines record per track as it
// closes, and a run-summary document with the parameter snapshot and one
// entry per saved event. Token `written` flags guarantee an event is
// never flushed twice even if the recorder sees it again.

use crate::config::DetectionConfig;
use crate::track::{Category, Track};
use crate::types::Rect;
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use tracing::{debug, info};

/// One record in the event stream, emitted when a track closes.
#[derive(Debug, Serialize)]
pub struct EventRecord {
    pub id: u32,
    pub start_frame: u32,
    pub end_frame: u32,
    pub start_timecode: Option<String>,
    pub end_timecode: Option<String>,
    pub centroid_history: Vec<[f32; 2]>,
    pub max_area: u32,
    pub category: Category,
}

/// One entry of the run summary.
#[derive(Debug, Serialize)]
pub struct EventSummaryRecord {
    pub id: u32,
    pub start_frame: u32,
    pub end_frame: u32,
    pub bounding_box: Rect,
    pub centroid: [f32; 2],
    pub saliency_score: f32,
    pub max_area: u32,
    pub category: Category,
    /// Feature vector consumed by the off-line classifier.
    pub property_vector: Vec<f32>,
}

/// Run summary document: run metadata, detection-parameter snapshot and
/// a record per saved event.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub generator: String,
    pub start_frame: u32,
    pub end_frame: u32,
    pub total_events: usize,
    pub parameters: DetectionConfig,
    pub events: Vec<EventSummaryRecord>,
}

pub struct EventRecorder {
    events_out: Option<Box<dyn Write + Send>>,
    summary: Vec<EventSummaryRecord>,
    records_written: u64,
    retain_boring: bool,
    min_event_frames: u32,
}

impl EventRecorder {
    pub fn new(
        events_out: Option<Box<dyn Write + Send>>,
        retain_boring: bool,
        min_event_frames: u32,
    ) -> Self {
        Self {
            events_out,
            summary: Vec::new(),
            records_written: 0,
            retain_boring,
            min_event_frames,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Flush a closed track. Tokens already flagged `written` are never
    /// emitted again; BORING events are consumed silently unless boring
    /// retention is on.
    pub fn record(&mut self, track: &mut Track) -> Result<()> {
        let unwritten: Vec<usize> = track
            .tokens()
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.written)
            .map(|(i, _)| i)
            .collect();
        if unwritten.is_empty() {
            debug!(id = track.id(), "event already written, skipping");
            return Ok(());
        }

        let category = track.category(self.min_event_frames);
        let keep = category == Category::Interesting || self.retain_boring;

        if keep {
            let record = EventRecord {
                id: track.id(),
                start_frame: track.start_frame(),
                end_frame: track.end_frame(),
                start_timecode: track.start_timecode(),
                end_timecode: track.end_timecode(),
                centroid_history: track
                    .centroid_history()
                    .iter()
                    .map(|c| [c.x, c.y])
                    .collect(),
                max_area: track.max_observed_area(),
                category,
            };
            if let Some(out) = self.events_out.as_mut() {
                let line = serde_json::to_string(&record).context("encoding event record")?;
                writeln!(out, "{line}").context("writing event record")?;
            }
            self.summary.push(self.summarize(track, category));
            self.records_written += 1;
            info!(
                id = record.id,
                start = record.start_frame,
                end = record.end_frame,
                max_area = record.max_area,
                "event recorded"
            );
        } else {
            debug!(id = track.id(), "boring event dropped");
        }

        for i in unwritten {
            track.tokens_mut()[i].written = true;
        }
        Ok(())
    }

    fn summarize(&self, track: &Track, category: Category) -> EventSummaryRecord {
        let (bounding_box, centroid, saliency_score) = match track.token_of_max_area() {
            Some(token) => (
                token.region.bounding_box(),
                [token.region.centroid().x, token.region.centroid().y],
                token.region.score(),
            ),
            None => (Rect::new(0, 0, 0, 0), [0.0, 0.0], 0.0),
        };
        EventSummaryRecord {
            id: track.id(),
            start_frame: track.start_frame(),
            end_frame: track.end_frame(),
            bounding_box,
            centroid,
            saliency_score,
            max_area: track.max_observed_area(),
            category,
            property_vector: track.property_vector(self.min_event_frames),
        }
    }

    /// Build the run-summary document. Call once, at end of stream.
    pub fn finish(
        mut self,
        parameters: &DetectionConfig,
        start_frame: u32,
        end_frame: u32,
    ) -> Result<RunSummary> {
        if let Some(out) = self.events_out.as_mut() {
            out.flush().context("flushing event stream")?;
        }
        Ok(RunSummary {
            generator: format!("deepwatch {}", env!("CARGO_PKG_VERSION")),
            start_frame,
            end_frame,
            total_events: self.summary.len(),
            parameters: parameters.clone(),
            events: self.summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::ConnectedRegion;
    use crate::track::Token;
    use crate::types::{GrayFrame, Point};
    use std::sync::{Arc, Mutex};

    /// Write adapter capturing output for assertions.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn make_track(id: u32, frames: u32) -> Track {
        let region = |left: i32| {
            let mut img = GrayFrame::zeros(64, 64);
            for y in 10..20 {
                for x in left..left + 10 {
                    img.set_pixel(x as usize, y, 255);
                }
            }
            let mut r = ConnectedRegion::from_seed(&img, Point::new(left, 10), 1).unwrap();
            r.set_score(0.5);
            r
        };
        let mut track = Track::new(
            id,
            Token::new(region(10), 0, Some("00:00:00:00".into())),
            0.1,
            2.0,
        );
        for i in 1..frames {
            track.assign(
                Token::new(region(10 + i as i32), i, Some(format!("00:00:00:{i:02}"))),
                None,
            );
        }
        track.close();
        track
    }

    #[test]
    fn test_record_emits_json_line() {
        let buf = SharedBuf::default();
        let mut rec = EventRecorder::new(Some(Box::new(buf.clone())), false, 5);
        let mut track = make_track(3, 8);
        rec.record(&mut track).unwrap();

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["start_frame"], 0);
        assert_eq!(value["end_frame"], 7);
        assert_eq!(value["max_area"], 100);
        assert_eq!(value["centroid_history"].as_array().unwrap().len(), 8);
        assert_eq!(value["category"], "Interesting");
        assert_eq!(rec.records_written(), 1);
    }

    #[test]
    fn test_written_flags_prevent_duplicates() {
        let buf = SharedBuf::default();
        let mut rec = EventRecorder::new(Some(Box::new(buf.clone())), false, 5);
        let mut track = make_track(1, 6);
        rec.record(&mut track).unwrap();
        rec.record(&mut track).unwrap();

        let bytes = buf.0.lock().unwrap().clone();
        assert_eq!(String::from_utf8(bytes).unwrap().lines().count(), 1);
        assert_eq!(rec.records_written(), 1);
        assert!(track.tokens().iter().all(|t| t.written));
    }

    #[test]
    fn test_boring_events_dropped_by_default() {
        let buf = SharedBuf::default();
        let mut rec = EventRecorder::new(Some(Box::new(buf.clone())), false, 10);
        let mut track = make_track(1, 3); // 3 frames < 10: boring
        rec.record(&mut track).unwrap();
        assert_eq!(rec.records_written(), 0);
        assert!(buf.0.lock().unwrap().is_empty());
        // tokens are still consumed
        assert!(track.tokens().iter().all(|t| t.written));

        let mut rec = EventRecorder::new(Some(Box::new(buf.clone())), true, 10);
        let mut track = make_track(2, 3);
        rec.record(&mut track).unwrap();
        assert_eq!(rec.records_written(), 1);
    }

    #[test]
    fn test_summary_document() {
        let mut rec = EventRecorder::new(None, false, 5);
        let mut a = make_track(1, 8);
        let mut b = make_track(2, 9);
        rec.record(&mut a).unwrap();
        rec.record(&mut b).unwrap();

        let params = DetectionConfig::default();
        let summary = rec.finish(&params, 0, 100).unwrap();
        assert_eq!(summary.total_events, 2);
        assert_eq!(summary.events[0].id, 1);
        assert_eq!(summary.events[0].max_area, 100);
        assert_eq!(summary.events[0].saliency_score, 0.5);
        assert_eq!(summary.events[0].property_vector.len(), 14);
        assert_eq!(summary.parameters.max_dist, params.max_dist);

        // the whole document serializes
        let json = serde_json::to_string_pretty(&summary).unwrap();
        assert!(json.contains("\"generator\""));
    }
}
