// src/track.rs
//
// A Track is one visual event: an ordered, append-only sequence of
// Tokens (one observation per frame) plus the lifecycle state machine
// and per-track Kalman state.
//
// Lifecycle: OPEN -> CLOSED -> WRITE_FINI -> DELETE (terminal).
// Association success keeps a track OPEN; expiration, span limits,
// out-of-bounds predictions and end-of-stream close it; the recorder
// flags written tracks WRITE_FINI; flagged tracks become DELETE and are
// purged on the next cleanup sweep. No track resurrects from CLOSED.

use crate::kalman::Kalman1D;
use crate::region::ConnectedRegion;
use crate::types::PointF;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    Open,
    Closed,
    WriteFini,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Boring,
    Interesting,
}

/// One observation of a track at one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub region: ConnectedRegion,
    /// Filtered location once assigned; the raw centroid before that.
    pub location: PointF,
    /// Predicted location at assignment time.
    pub prediction: Option<PointF>,
    /// Drift (focus of expansion) observed at assignment.
    pub drift: Option<PointF>,
    /// Angle between the motion line and the connection to the drift
    /// point, radians.
    pub angle: f32,
    pub frame_number: u32,
    /// Source metadata, e.g. a timecode string.
    pub timecode: Option<String>,
    /// Placeholder token extrapolated through a missed frame; not a real
    /// match and never advances `valid_end_frame`.
    #[serde(default)]
    pub extrapolated: bool,
    /// Already flushed to persistent storage; incremental writers skip it.
    #[serde(default)]
    pub written: bool,
}

impl Token {
    pub fn new(region: ConnectedRegion, frame_number: u32, timecode: Option<String>) -> Self {
        let location = region.centroid();
        Self {
            region,
            location,
            prediction: None,
            drift: None,
            angle: 0.0,
            frame_number,
            timecode,
            extrapolated: false,
            written: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Process-unique, monotonically increasing; allocated by TrackSet.
    id: u32,
    tokens: Vec<Token>,
    start_frame: u32,
    end_frame: u32,
    /// Last frame with a real (non-extrapolated) match.
    valid_end_frame: u32,
    max_area: u32,
    max_area_frame: u32,
    min_area: u32,
    state: TrackState,
    x_filter: Kalman1D,
    y_filter: Kalman1D,
}

impl Track {
    pub fn new(id: u32, token: Token, process_noise: f32, measurement_noise: f32) -> Self {
        let frame = token.frame_number;
        let area = token.region.area();
        let loc = token.location;
        debug!(
            id,
            frame,
            area,
            x = loc.x,
            y = loc.y,
            "opening track"
        );
        Self {
            id,
            tokens: vec![token],
            start_frame: frame,
            end_frame: frame,
            valid_end_frame: frame,
            max_area: area,
            max_area_frame: frame,
            min_area: area,
            state: TrackState::Open,
            x_filter: Kalman1D::new(loc.x, process_noise, measurement_noise),
            y_filter: Kalman1D::new(loc.y, process_noise, measurement_noise),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TrackState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == TrackState::Closed
    }

    pub fn close(&mut self) {
        if self.state == TrackState::Open {
            self.state = TrackState::Closed;
        }
    }

    pub fn flag_write_complete(&mut self) {
        self.state = TrackState::WriteFini;
    }

    pub fn flag_for_delete(&mut self) {
        self.state = TrackState::Delete;
    }

    pub fn is_ready_to_delete(&self) -> bool {
        self.state == TrackState::Delete
    }

    pub fn start_frame(&self) -> u32 {
        self.start_frame
    }

    pub fn end_frame(&self) -> u32 {
        self.end_frame
    }

    pub fn valid_end_frame(&self) -> u32 {
        self.valid_end_frame
    }

    pub fn number_of_frames(&self) -> u32 {
        self.end_frame - self.start_frame + 1
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn max_observed_area(&self) -> u32 {
        self.max_area
    }

    pub fn max_area_frame(&self) -> u32 {
        self.max_area_frame
    }

    pub fn min_observed_area(&self) -> u32 {
        self.min_area
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn tokens_mut(&mut self) -> &mut [Token] {
        &mut self.tokens
    }

    pub fn start_timecode(&self) -> Option<String> {
        self.tokens.first().and_then(|t| t.timecode.clone())
    }

    pub fn end_timecode(&self) -> Option<String> {
        self.tokens.last().and_then(|t| t.timecode.clone())
    }

    /// INTERESTING once the event spans at least `min_event_frames`.
    pub fn category(&self, min_event_frames: u32) -> Category {
        if self.number_of_frames() >= min_event_frames {
            Category::Interesting
        } else {
            Category::Boring
        }
    }

    /// One-step-ahead prediction from the two per-axis filters.
    pub fn predicted_location(&self) -> PointF {
        PointF::new(self.x_filter.predicted(), self.y_filter.predicted())
    }

    /// Whether a token at `frame` may be appended: strictly after the
    /// current end, and only onto an open track.
    pub fn accepts_frame(&self, frame: u32) -> bool {
        self.state == TrackState::Open && frame > self.end_frame
    }

    /// Association cost of a measurement at `location` for `frame`:
    /// sum of the per-axis innovation costs. `None` when the track cannot
    /// take a token at that frame.
    pub fn cost(&self, location: PointF, frame: u32) -> Option<f32> {
        if !self.accepts_frame(frame) {
            return None;
        }
        Some(self.x_filter.cost(location.x) + self.y_filter.cost(location.y))
    }

    /// Append a real match. Updates both filters; the stored token keeps
    /// the prediction it was matched against and the filtered location.
    pub fn assign(&mut self, mut token: Token, drift: Option<PointF>) {
        debug_assert!(self.accepts_frame(token.frame_number));

        // saliency score propagates along the track unless the new
        // region brought its own
        if token.region.score() == 0.0 {
            if let Some(last) = self.tokens.last() {
                token.region.set_score(last.region.score());
            }
        }

        token.prediction = Some(self.predicted_location());
        let raw = token.location;
        token.location = PointF::new(self.x_filter.update(raw.x), self.y_filter.update(raw.y));
        token.drift = drift;

        // motion line from the first observation through this one
        if let Some(first) = self.tokens.first() {
            let dir = first.location - token.location;
            token.angle = match drift {
                Some(foe) => dir.angle_between(&(token.location - foe)),
                None => 0.0,
            };
        }

        let area = token.region.area();
        if area > self.max_area {
            self.max_area = area;
            self.max_area_frame = token.frame_number;
        }
        if area < self.min_area {
            self.min_area = area;
        }
        self.end_frame = token.frame_number;
        self.valid_end_frame = token.frame_number;
        self.tokens.push(token);
    }

    /// Append an extrapolated placeholder at the predicted location to
    /// carry the track through a missed frame. The filters are not
    /// updated and `valid_end_frame` does not advance.
    pub fn assign_extrapolated(&mut self, frame: u32, drift: Option<PointF>) {
        debug_assert!(self.accepts_frame(frame));
        // unwrap is safe: a track always holds its seed token
        let mut token = self.tokens.last().unwrap().clone();
        token.frame_number = frame;
        token.prediction = Some(self.predicted_location());
        token.location = self.predicted_location();
        token.drift = drift;
        token.extrapolated = true;
        token.written = false;
        self.end_frame = frame;
        self.tokens.push(token);
    }

    pub fn frame_in_range(&self, frame: u32) -> bool {
        frame >= self.start_frame && frame <= self.end_frame
    }

    pub fn token_for_frame(&self, frame: u32) -> Option<&Token> {
        self.tokens.iter().find(|t| t.frame_number == frame)
    }

    /// Replace the region observed at `frame` in place. Used when a
    /// freshly nominated candidate lands on this track: the track keeps
    /// its identity and absorbs the better-segmented shape.
    pub fn replace_region(&mut self, frame: u32, region: ConnectedRegion) -> bool {
        if let Some(token) = self.tokens.iter_mut().find(|t| t.frame_number == frame) {
            token.region = region;
            true
        } else {
            false
        }
    }

    /// Whether the observation at `frame` spatially intersects `region`.
    pub fn intersects_at(&self, region: &ConnectedRegion, frame: u32) -> bool {
        match self.token_for_frame(frame) {
            Some(token) => token.region.intersects(region),
            None => false,
        }
    }

    pub fn token_of_max_area(&self) -> Option<&Token> {
        self.token_for_frame(self.max_area_frame)
    }

    /// Mean change of inter-frame centroid speed over the last three
    /// samples. Large magnitudes indicate a tracking failure.
    pub fn acceleration(&self) -> f32 {
        const NUM_SAMPLES: u32 = 3;
        if self.number_of_frames() <= 2 {
            return 0.0;
        }
        let end = self.end_frame;
        let mut frame = end.saturating_sub(NUM_SAMPLES - 1);
        let mut init = false;
        let mut last_speed = 0.0f32;
        let mut sum = 0.0f32;
        while frame < end {
            let pair = (self.token_for_frame(frame), self.token_for_frame(frame + 1));
            if let (Some(t1), Some(t2)) = pair {
                if t1.region.is_valid() && t2.region.is_valid() {
                    let speed = t1.region.centroid().distance_to(&t2.region.centroid());
                    if init {
                        sum += speed - last_speed;
                    } else {
                        init = true;
                    }
                    last_speed = speed;
                }
            }
            frame += 1;
        }
        sum / NUM_SAMPLES as f32
    }

    /// Maximum bounding-box dimensions over all tokens.
    pub fn max_object_dims(&self) -> (i32, i32) {
        let mut w = 0;
        let mut h = 0;
        for t in &self.tokens {
            let (tw, th) = t.region.object_dims();
            w = w.max(tw);
            h = h.max(th);
        }
        (w, h)
    }

    pub fn centroid_history(&self) -> Vec<PointF> {
        self.tokens.iter().map(|t| t.region.centroid()).collect()
    }

    /// Feature vector for the off-line classifier: id, category, area,
    /// second moments, ellipse fit, intensity range, drift angle.
    pub fn property_vector(&self, min_event_frames: u32) -> Vec<f32> {
        let mut vec = Vec::with_capacity(14);
        vec.push(self.id as f32);
        vec.push(match self.category(min_event_frames) {
            Category::Boring => 0.0,
            Category::Interesting => 1.0,
        });

        let Some(token) = self.token_of_max_area() else {
            vec.push(-1.0);
            vec.extend(std::iter::repeat(0.0).take(11));
            return vec;
        };
        if !token.region.is_valid() {
            vec.push(-1.0);
            vec.extend(std::iter::repeat(0.0).take(11));
            return vec;
        }

        vec.push(token.region.area() as f32);
        let m = token.region.second_moments();
        vec.push(m.uxx);
        vec.push(m.uyy);
        vec.push(m.uxy);
        vec.push(m.major_axis);
        vec.push(m.minor_axis);
        vec.push(m.elongation);
        vec.push(m.orientation);
        match token.region.intensity() {
            Some(s) => {
                vec.push(s.max);
                vec.push(s.min);
                vec.push(s.avg);
            }
            None => {
                vec.push(0.0);
                vec.push(0.0);
                vec.push(0.0);
            }
        }
        vec.push(token.angle);
        vec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GrayFrame, Point};

    fn square_region(left: i32, top: i32, size: i32) -> ConnectedRegion {
        let mut img = GrayFrame::zeros(128, 128);
        for y in top..top + size {
            for x in left..left + size {
                img.set_pixel(x as usize, y as usize, 255);
            }
        }
        ConnectedRegion::from_seed(&img, Point::new(left, top), 1).unwrap()
    }

    fn track_with_motion(frames: u32) -> Track {
        let mut track = Track::new(
            7,
            Token::new(square_region(20, 20, 10), 10, Some("00:00:00:10".into())),
            0.1,
            2.0,
        );
        for i in 1..frames {
            let token = Token::new(square_region(20 + 2 * i as i32, 20, 10), 10 + i, None);
            track.assign(token, None);
        }
        track
    }

    #[test]
    fn test_new_track_state() {
        let track = track_with_motion(1);
        assert_eq!(track.state(), TrackState::Open);
        assert_eq!(track.start_frame(), 10);
        assert_eq!(track.end_frame(), 10);
        assert_eq!(track.valid_end_frame(), 10);
        assert_eq!(track.max_observed_area(), 100);
        assert_eq!(track.token_count(), 1);
    }

    #[test]
    fn test_assign_advances_frames_monotonically() {
        let track = track_with_motion(8);
        assert_eq!(track.end_frame(), 17);
        assert_eq!(track.valid_end_frame(), 17);
        assert_eq!(track.number_of_frames(), 8);
        let mut prev = 0;
        for t in track.tokens() {
            assert!(t.frame_number >= prev);
            prev = t.frame_number;
        }
    }

    #[test]
    fn test_extrapolated_token_does_not_validate() {
        let mut track = track_with_motion(5);
        let valid_end = track.valid_end_frame();
        let pred_before = track.predicted_location();
        track.assign_extrapolated(15, None);
        assert_eq!(track.end_frame(), 15);
        assert_eq!(track.valid_end_frame(), valid_end);
        assert!(track.tokens().last().unwrap().extrapolated);
        // the filter was not touched
        assert_eq!(track.predicted_location(), pred_before);
    }

    #[test]
    fn test_category_threshold() {
        let track = track_with_motion(5);
        assert_eq!(track.category(5), Category::Interesting);
        assert_eq!(track.category(6), Category::Boring);
    }

    #[test]
    fn test_no_resurrection_after_close() {
        let mut track = track_with_motion(3);
        track.close();
        assert!(track.is_closed());
        assert!(!track.accepts_frame(100));
        // close is idempotent and does not regress later states
        track.flag_write_complete();
        track.close();
        assert_eq!(track.state(), TrackState::WriteFini);
    }

    #[test]
    fn test_cost_rejects_stale_frames() {
        let track = track_with_motion(3);
        assert!(track.cost(PointF::new(0.0, 0.0), 12).is_none());
        assert!(track.cost(PointF::new(0.0, 0.0), 13).is_some());
    }

    #[test]
    fn test_cost_prefers_predicted_location() {
        let track = track_with_motion(10);
        let pred = track.predicted_location();
        let near = track.cost(pred, 20).unwrap();
        let far = track
            .cost(PointF::new(pred.x + 25.0, pred.y + 25.0), 20)
            .unwrap();
        assert!(near < far);
    }

    #[test]
    fn test_replace_region_keeps_identity() {
        let mut track = track_with_motion(3);
        let replacement = square_region(23, 21, 9);
        assert!(track.replace_region(12, replacement));
        assert_eq!(track.token_for_frame(12).unwrap().region.area(), 81);
        assert!(!track.replace_region(99, square_region(0, 0, 2)));
    }

    #[test]
    fn test_steady_motion_has_small_acceleration() {
        let track = track_with_motion(10);
        assert!(track.acceleration().abs() < 1.0);
    }

    #[test]
    fn test_serde_round_trip_idempotent() {
        let track = track_with_motion(6);
        let json = serde_json::to_string(&track).unwrap();
        let once: Track = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&once).unwrap();
        let twice: Track = serde_json::from_str(&json2).unwrap();

        for t in [&once, &twice] {
            assert_eq!(t.id(), track.id());
            assert_eq!(t.start_frame(), track.start_frame());
            assert_eq!(t.end_frame(), track.end_frame());
            assert_eq!(t.token_count(), track.token_count());
        }
    }

    #[test]
    fn test_property_vector_shape() {
        let track = track_with_motion(6);
        let pv = track.property_vector(5);
        assert_eq!(pv.len(), 14);
        assert_eq!(pv[0], 7.0);
        assert_eq!(pv[1], 1.0);
        assert_eq!(pv[2], 100.0);
    }
}
