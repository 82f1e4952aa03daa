// src/track_set.rs
//
// The association engine. Owns every track of a run, matches new
// detections against open tracks once per frame with the configured
// strategy, seeds new tracks from nominated candidates, and sweeps the
// lifecycle states.
//
// Invariant: a newly observed region that spatially intersects an
// already-open track updates that track in place instead of spawning a
// new one, so no two tracks ever claim the same pixels at their most
// recent observation.

use crate::config::{DetectionConfig, TrackingMode};
use crate::region::{extract_regions, ConnectedRegion};
use crate::track::{Token, Track};
use crate::types::{GrayFrame, PointF, Rect};
use tracing::{debug, info};

pub struct TrackSet {
    tracks: Vec<Track>,
    /// Monotonic id source for the whole run. Mutated only by the single
    /// track-stage worker; if the topology ever gains a second writer
    /// this must become an atomic or a partitioned range.
    next_id: u32,
    start_frame: Option<u32>,
    end_frame: Option<u32>,
    params: DetectionConfig,
}

/// Decision for one open track at one frame.
enum Association {
    Accept(ConnectedRegion),
    Extrapolate,
    Close(&'static str),
}

impl TrackSet {
    pub fn new(params: DetectionConfig) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 0,
            start_frame: None,
            end_frame: None,
            params,
        }
    }

    pub fn num_events(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn start_frame(&self) -> Option<u32> {
        self.start_frame
    }

    pub fn end_frame(&self) -> Option<u32> {
        self.end_frame
    }

    pub fn get(&self, id: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id() == id)
    }

    fn touch_bounds(&mut self, frame: u32) {
        if self.start_frame.is_none() {
            self.start_frame = Some(frame);
        }
        match self.end_frame {
            Some(end) if end >= frame => {}
            _ => self.end_frame = Some(frame),
        }
    }

    /// Run per-frame association of every open track against the new
    /// foreground mask. `reference` is the grayscale frame used to fill
    /// in intensity statistics of accepted regions.
    pub fn update_events(
        &mut self,
        mask: &GrayFrame,
        frame: u32,
        drift: Option<PointF>,
        timecode: Option<&str>,
        reference: Option<&GrayFrame>,
    ) {
        self.touch_bounds(frame);
        if self.params.tracking_mode == TrackingMode::None {
            return;
        }

        let open: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| self.tracks[i].is_open())
            .collect();

        for ti in open {
            let decision = match self.params.tracking_mode {
                TrackingMode::Kalman => self.associate_kalman(ti, mask, frame),
                TrackingMode::NearestNeighbor => self.associate_nearest(ti, mask, frame),
                TrackingMode::None => unreachable!(),
            };
            self.apply(ti, decision, frame, drift, timecode, reference);
        }
    }

    /// Kalman strategy: search a square window around the filter
    /// prediction, score candidates by innovation cost plus an area
    /// ratio, accept the cheapest under the cost ceiling.
    fn associate_kalman(&self, ti: usize, mask: &GrayFrame, frame: u32) -> Association {
        let track = &self.tracks[ti];
        let pred = track.predicted_location();
        let gone = self.params.max_dist;
        let (w, h) = (mask.width as f32, mask.height as f32);

        // prediction too far outside the image closes the track outright,
        // regardless of the expiration budget
        if pred.x < -(gone as f32)
            || pred.x >= w + gone as f32
            || pred.y < -(gone as f32)
            || pred.y >= h + gone as f32
        {
            return Association::Close("prediction out of bounds");
        }

        let mut center = pred.round();
        center.x = center.x.max(0);
        center.y = center.y.max(0);
        let window = Rect::centered_square(center, self.params.max_dist);
        let Some(window) = window.clip_to(mask.width, mask.height) else {
            return Association::Close("empty search window");
        };

        let last = match track.tokens().last() {
            Some(t) => t,
            None => return Association::Close("track has no tokens"),
        };
        let last_area = last.region.area();
        let last_bbox = last.region.bounding_box();
        let (min_area, max_area) = self.candidate_area_bounds(last_area);

        let mut candidates = extract_regions(mask, &window, min_area, max_area);
        candidates.retain(|c| !self.intersects_other(ti, c, frame));
        debug!(
            id = track.id(),
            frame,
            n = candidates.len(),
            px = pred.x,
            py = pred.y,
            "kalman candidates in window"
        );

        let mut best: Option<(usize, f32)> = None;
        for (ci, cand) in candidates.iter().enumerate() {
            let Some(innovation) = track.cost(cand.centroid(), frame) else {
                continue;
            };
            let area_cost = last_area as f32 / cand.area() as f32;
            let cost = innovation + area_cost;
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((ci, cost));
            }
        }

        let Some((ci, cost)) = best else {
            return self.miss(track, frame);
        };
        if cost > self.params.max_cost {
            debug!(id = track.id(), frame, cost, "best candidate over cost ceiling");
            return self.miss(track, frame);
        }
        let cand = &candidates[ci];
        // a bounding box skewed away on both corners is a segmentation
        // artifact, not the same object
        let (dist_tl, dist_br) = corner_distances(&last_bbox, &cand.bounding_box());
        if dist_tl > self.params.max_cost && dist_br > self.params.max_cost {
            debug!(id = track.id(), frame, dist_tl, dist_br, "bounding box too skewed");
            return self.miss(track, frame);
        }
        if cand.area() as f32 > 3.0 * last_area as f32 {
            return self.miss(track, frame);
        }
        Association::Accept(candidates.swap_remove(ci))
    }

    /// Nearest-neighbor strategy: search around the last observation,
    /// score by centroid distance plus the distances between the two
    /// bounding boxes' corner pairs. The terms mix units; only the
    /// relative ordering matters and the cheapest candidate wins.
    fn associate_nearest(&self, ti: usize, mask: &GrayFrame, frame: u32) -> Association {
        let track = &self.tracks[ti];
        let last = match track.tokens().last() {
            Some(t) => t,
            None => return Association::Close("track has no tokens"),
        };
        let last_area = last.region.area();
        let last_bbox = last.region.bounding_box();
        let (ow, oh) = last.region.object_dims();
        let half = ow.max(oh) / 2 + self.params.max_dist;

        let center = last.region.centroid().round();
        let window = Rect::centered_square(center, half);
        let Some(window) = window.clip_to(mask.width, mask.height) else {
            return Association::Close("empty search window");
        };

        let (min_area, max_area) = self.candidate_area_bounds(last_area);
        let mut candidates = extract_regions(mask, &window, min_area, max_area);
        candidates.retain(|c| !self.intersects_other(ti, c, frame));

        if !track.accepts_frame(frame) {
            return self.miss(track, frame);
        }
        let last_centroid = last.region.centroid();
        let mut best: Option<(usize, f32)> = None;
        for (ci, cand) in candidates.iter().enumerate() {
            let centroid_dist = last_centroid.distance_to(&cand.centroid());
            let (dist_tl, dist_br) = corner_distances(&last_bbox, &cand.bounding_box());
            let cost = centroid_dist + dist_tl + dist_br;
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((ci, cost));
            }
        }

        let Some((ci, cost)) = best else {
            return self.miss(track, frame);
        };
        if cost > self.params.max_cost {
            return self.miss(track, frame);
        }
        if candidates[ci].area() as f32 > 3.0 * last_area as f32 {
            return self.miss(track, frame);
        }
        Association::Accept(candidates.swap_remove(ci))
    }

    /// No acceptable candidate this frame: close once the expiration
    /// budget is spent, otherwise coast on an extrapolated token.
    fn miss(&self, track: &Track, frame: u32) -> Association {
        let unmatched = frame.saturating_sub(track.valid_end_frame());
        if unmatched > self.params.expiration_frames {
            Association::Close("no match within expiration budget")
        } else {
            Association::Extrapolate
        }
    }

    fn apply(
        &mut self,
        ti: usize,
        decision: Association,
        frame: u32,
        drift: Option<PointF>,
        timecode: Option<&str>,
        reference: Option<&GrayFrame>,
    ) {
        match decision {
            Association::Accept(mut region) => {
                if let Some(reference) = reference {
                    // recoverable: a mismatched reference only loses stats
                    if let Err(err) = region.measure_intensity(reference) {
                        debug!(%err, "skipping intensity measurement");
                    }
                }
                let token = Token::new(region, frame, timecode.map(str::to_string));
                let track = &mut self.tracks[ti];
                debug!(
                    id = track.id(),
                    frame,
                    area = token.region.area(),
                    "token associated"
                );
                track.assign(token, drift);

                if self.params.max_acceleration > 0.0 {
                    let track = &self.tracks[ti];
                    let acc = track.acceleration();
                    if acc.abs() > self.params.max_acceleration {
                        info!(id = track.id(), frame, acc, "tracker acceleration error, closing");
                        self.tracks[ti].close();
                    }
                }
            }
            Association::Extrapolate => {
                let track = &mut self.tracks[ti];
                debug!(
                    id = track.id(),
                    frame, "no token found, extrapolating through miss"
                );
                track.assign_extrapolated(frame, drift);
            }
            Association::Close(reason) => {
                let track = &mut self.tracks[ti];
                info!(id = track.id(), frame, reason, "closing track");
                track.close();
            }
        }
    }

    /// Candidate areas may shrink to half or double relative to the last
    /// observation, still clamped to the configured global bounds.
    fn candidate_area_bounds(&self, last_area: u32) -> (u32, u32) {
        let min = self.params.min_event_area.max(last_area / 2);
        let max = self.params.max_event_area.min(last_area.saturating_mul(2));
        (min, max.max(min))
    }

    /// Whether `region` intersects any track other than `ti` observed at
    /// `frame`.
    fn intersects_other(&self, ti: usize, region: &ConnectedRegion, frame: u32) -> bool {
        self.tracks
            .iter()
            .enumerate()
            .any(|(i, t)| i != ti && t.intersects_at(region, frame))
    }

    /// Seed new tracks from nominated candidate regions. A candidate that
    /// intersects an existing track's observation at this frame replaces
    /// that observation instead of opening a new track.
    pub fn initiate_events(
        &mut self,
        candidates: Vec<ConnectedRegion>,
        frame: u32,
        timecode: Option<&str>,
        reference: Option<&GrayFrame>,
    ) {
        self.touch_bounds(frame);

        for mut region in candidates {
            let hit = self
                .tracks
                .iter_mut()
                .find(|t| t.intersects_at(&region, frame));
            if let Some(track) = hit {
                debug!(
                    id = track.id(),
                    frame, "candidate intersects existing track, absorbing region"
                );
                track.replace_region(frame, region);
                continue;
            }

            if let Some(reference) = reference {
                if let Err(err) = region.measure_intensity(reference) {
                    debug!(%err, "skipping intensity measurement");
                }
            }
            self.next_id += 1;
            let area = region.area();
            let token = Token::new(region, frame, timecode.map(str::to_string));
            let track = Track::new(
                self.next_id,
                token,
                self.params.kalman_process_noise,
                self.params.kalman_measurement_noise,
            );
            info!(id = self.next_id, frame, area, "new event");
            self.tracks.push(track);
        }
    }

    /// Extract candidate regions from the mask at the nominated points
    /// and seed events from them. A candidate on background is simply
    /// absent; an extraction invariant violation is fatal and propagates.
    pub fn seed_from_points(
        &mut self,
        mask: &GrayFrame,
        points: &[crate::types::Point],
        scores: &[f32],
        frame: u32,
        timecode: Option<&str>,
        reference: Option<&GrayFrame>,
    ) -> crate::error::CoreResult<()> {
        let mut regions: Vec<ConnectedRegion> = Vec::new();
        for (i, &p) in points.iter().enumerate() {
            match ConnectedRegion::from_seed(mask, p, 1) {
                Ok(mut region) => {
                    let area = region.area();
                    if area < self.params.min_event_area || area > self.params.max_event_area {
                        debug!(frame, area, "candidate outside event area bounds");
                        continue;
                    }
                    if regions.iter().any(|r| r.intersects(&region)) {
                        continue;
                    }
                    region.set_score(scores.get(i).copied().unwrap_or(0.0));
                    regions.push(region);
                }
                Err(err) if !err.is_fatal() => {
                    debug!(frame, x = p.x, y = p.y, "candidate point on background");
                }
                Err(err) => return Err(err),
            }
        }
        self.initiate_events(regions, frame, timecode, reference);
        Ok(())
    }

    /// Sweep all tracks: purge DELETE, force-close OPEN tracks past the
    /// maximum span, leave the rest untouched.
    pub fn clean_up(&mut self, current_frame: u32) {
        let max_frames = self.params.max_event_frames;
        self.tracks.retain(|t| {
            if t.is_ready_to_delete() {
                debug!(id = t.id(), "erasing event");
                false
            } else {
                true
            }
        });
        if max_frames > 0 {
            for track in self.tracks.iter_mut().filter(|t| t.is_open()) {
                if current_frame > track.start_frame() + max_frames {
                    info!(
                        id = track.id(),
                        max_frames, "event reached max frame count, closing"
                    );
                    track.close();
                }
            }
        }
    }

    /// Close every open track (end-of-stream).
    pub fn close_all(&mut self) {
        for track in &mut self.tracks {
            track.close();
        }
    }

    /// Ids of tracks ready to be flushed by the recorder.
    pub fn ready_to_save_ids(&self) -> Vec<u32> {
        self.tracks
            .iter()
            .filter(|t| t.is_closed())
            .map(|t| t.id())
            .collect()
    }

    /// All tracks participating in `frame`.
    pub fn events_for_frame(&self, frame: u32) -> Vec<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.frame_in_range(frame))
            .collect()
    }

    /// Latest frame at or before `current` by which every track that had
    /// started is closed; `None` when no such frame exists.
    pub fn all_closed_before(&self, current: u32) -> Option<u32> {
        (0..=current).rev().find(|&frame| {
            self.tracks
                .iter()
                .all(|t| frame < t.start_frame() || !t.is_open())
        })
    }

    /// Mean speed of open tracks over their last real step, a cheap
    /// run-level diagnostic.
    pub fn average_speed(&self) -> f32 {
        let mut sum = 0.0f32;
        let mut n = 0u32;
        for track in self.tracks.iter().filter(|t| t.is_open()) {
            let tokens = track.tokens();
            if tokens.len() >= 2 {
                let a = &tokens[tokens.len() - 2];
                let b = &tokens[tokens.len() - 1];
                sum += a.region.centroid().distance_to(&b.region.centroid());
                n += 1;
            }
        }
        if n > 0 {
            sum / n as f32
        } else {
            0.0
        }
    }

    /// Property vectors of every closed track, for the off-line
    /// classifier export.
    pub fn property_vectors_to_save(&self) -> Vec<Vec<f32>> {
        self.tracks
            .iter()
            .filter(|t| t.is_closed())
            .map(|t| t.property_vector(self.params.min_event_frames))
            .collect()
    }

    pub fn params(&self) -> &DetectionConfig {
        &self.params
    }
}

/// Euclidean distances between the top-left and bottom-right corner
/// pairs of two bounding boxes.
fn corner_distances(a: &Rect, b: &Rect) -> (f32, f32) {
    let tl = (((a.top - b.top).pow(2) + (a.left - b.left).pow(2)) as f32).sqrt();
    let br = (((a.bottom() - b.bottom()).pow(2) + (a.right() - b.right()).pow(2)) as f32).sqrt();
    (tl, br)
}
