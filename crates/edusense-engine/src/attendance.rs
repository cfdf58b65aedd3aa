//! Per-session attendance: frame matches in, one tally per enrolled identity out.

use crate::error::{PipelineError, PipelineFailure};
use crate::store::AttendanceStore;
use crate::tasks::{TaskContext, TaskOutput};
use edusense_core::alignment::crop_face;
use edusense_core::{BoundingBox, Candidate, CosineMatcher, Detection, EmotionClassifier, FaceExtractor, Matcher};
use edusense_media::{FrameExtractor, FrameSampler, SampledFrame};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Knobs that decide who counts as present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttendancePolicy {
    /// Minimum cosine similarity for a detection to count as an identity.
    pub threshold: f32,
    /// Matched frames needed for `present`. Anything below is `absent`.
    pub min_appearances: u32,
    /// Label matched faces with the expression classifier.
    pub emotion_enabled: bool,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self {
            threshold: edusense_core::DEFAULT_SIMILARITY_THRESHOLD,
            min_appearances: 1,
            emotion_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TallyStatus {
    Present,
    Absent,
    ManuallyOverridden,
}

impl TallyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TallyStatus::Present => "present",
            TallyStatus::Absent => "absent",
            TallyStatus::ManuallyOverridden => "manually-overridden",
        }
    }
}

impl FromStr for TallyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(TallyStatus::Present),
            "absent" => Ok(TallyStatus::Absent),
            "manually-overridden" => Ok(TallyStatus::ManuallyOverridden),
            other => Err(format!("unknown tally status: {other}")),
        }
    }
}

/// Attendance outcome for one identity in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTally {
    pub identity_id: String,
    /// Sampled frames in which this identity was matched at least once.
    pub appearance_count: u32,
    pub dominant_emotion: Option<String>,
    pub status: TallyStatus,
    /// Best frame for this identity: a `frame:<index>@<ms>ms` reference or an evidence image path.
    pub evidence_reference: Option<String>,
    pub disputed: bool,
    pub note: Option<String>,
    /// Set once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Sighting of an identity with the highest detector confidence.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub frame_index: u64,
    pub timestamp: Duration,
    /// Detector confidence of the face; selects the evidence frame.
    pub confidence: f32,
    /// Match similarity of the same face, for reference only.
    pub similarity: f32,
    pub face: BoundingBox,
    /// Face crop, kept only when evidence images are requested.
    pub crop: Option<RgbImage>,
}

impl Evidence {
    pub fn reference(&self) -> String {
        format!("frame:{}@{}ms", self.frame_index, self.timestamp.as_millis())
    }
}

#[derive(Default)]
struct Accumulator {
    appearances: u32,
    last_frame: Option<u64>,
    evidence: Option<Evidence>,
    /// Label counts in first-seen order.
    emotions: Vec<(String, u32)>,
}

impl Accumulator {
    fn record_emotion(&mut self, label: String) {
        match self.emotions.iter_mut().find(|(l, _)| *l == label) {
            Some((_, count)) => *count += 1,
            None => self.emotions.push((label, 1)),
        }
    }

    fn dominant_emotion(&self) -> Option<String> {
        let mut best: Option<&(String, u32)> = None;
        for entry in &self.emotions {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(label, _)| label.clone())
    }
}

/// Folds a session's frames into per-identity tallies.
///
/// Frames must be fed in sampling order: evidence ties go to the earlier frame.
pub struct AttendanceAggregator {
    roster: Vec<Candidate>,
    slots: Vec<Accumulator>,
    policy: AttendancePolicy,
    matcher: CosineMatcher,
    emotion: Option<Arc<dyn EmotionClassifier>>,
    keep_crops: bool,
    frames: u64,
    unknown_faces: u64,
}

/// What one frame contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSummary {
    pub faces: usize,
    pub matched: usize,
    pub unknown: usize,
}

/// Aggregation result before it is stored.
pub struct AggregateResult {
    /// One tally per roster entry, in roster order.
    pub tallies: Vec<SessionTally>,
    /// Evidence per identity id, for identities seen at least once.
    pub evidence: HashMap<String, Evidence>,
    pub frames: u64,
    pub unknown_faces: u64,
}

impl AttendanceAggregator {
    pub fn new(roster: Vec<Candidate>, policy: AttendancePolicy) -> Self {
        let slots = roster.iter().map(|_| Accumulator::default()).collect();
        Self {
            roster,
            slots,
            policy,
            matcher: CosineMatcher,
            emotion: None,
            keep_crops: false,
            frames: 0,
            unknown_faces: 0,
        }
    }

    /// Classifier used for dominant emotions when the policy enables them.
    pub fn with_emotion(mut self, classifier: Arc<dyn EmotionClassifier>) -> Self {
        self.emotion = Some(classifier);
        self
    }

    /// Keep a face crop alongside each identity's evidence.
    pub fn keep_evidence_crops(mut self, keep: bool) -> Self {
        self.keep_crops = keep;
        self
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Match every detection of `frame` against the roster.
    pub fn observe(&mut self, frame: &SampledFrame, detections: &[Detection]) -> FrameSummary {
        self.frames += 1;
        let mut summary = FrameSummary {
            faces: detections.len(),
            ..FrameSummary::default()
        };

        for detection in detections {
            let result = self
                .matcher
                .compare(&detection.embedding, &self.roster, self.policy.threshold);
            let Some(identity_id) = result.identity_id else {
                self.unknown_faces += 1;
                summary.unknown += 1;
                continue;
            };
            let Some(slot) = self.roster.iter().position(|c| c.identity_id == identity_id) else {
                continue;
            };
            summary.matched += 1;

            let label = self.label(frame, detection);
            let keep_crops = self.keep_crops;
            let acc = &mut self.slots[slot];
            if acc.last_frame != Some(frame.index) {
                acc.appearances += 1;
                acc.last_frame = Some(frame.index);
            }
            if acc.evidence.as_ref().map_or(true, |e| detection.confidence() > e.confidence) {
                acc.evidence = Some(Evidence {
                    frame_index: frame.index,
                    timestamp: frame.timestamp,
                    confidence: detection.confidence(),
                    similarity: result.similarity,
                    face: detection.face.clone(),
                    crop: if keep_crops {
                        crop_face(&frame.image, &detection.face)
                    } else {
                        None
                    },
                });
            }
            if let Some(label) = label {
                acc.record_emotion(label);
            }
        }

        tracing::trace!(
            frame = frame.index,
            faces = summary.faces,
            matched = summary.matched,
            "frame aggregated"
        );
        summary
    }

    fn label(&self, frame: &SampledFrame, detection: &Detection) -> Option<String> {
        if !self.policy.emotion_enabled {
            return None;
        }
        let classifier = self.emotion.as_ref()?;
        let crop = crop_face(&frame.image, &detection.face)?;
        match classifier.classify(&crop) {
            Ok(label) => Some(label),
            Err(e) => {
                tracing::warn!(frame = frame.index, error = %e, "emotion classification failed");
                None
            }
        }
    }

    /// Close the session: every roster entry gets a tally, absent unless seen often enough.
    pub fn finish(self) -> AggregateResult {
        let required = self.policy.min_appearances.max(1);
        let mut tallies = Vec::with_capacity(self.roster.len());
        let mut evidence = HashMap::new();

        for (candidate, acc) in self.roster.into_iter().zip(self.slots) {
            let present = acc.appearances >= required;
            let dominant_emotion = if present { acc.dominant_emotion() } else { None };
            tallies.push(SessionTally {
                identity_id: candidate.identity_id.clone(),
                appearance_count: acc.appearances,
                dominant_emotion,
                status: if present {
                    TallyStatus::Present
                } else {
                    TallyStatus::Absent
                },
                evidence_reference: acc.evidence.as_ref().map(Evidence::reference),
                disputed: false,
                note: None,
                updated_at: None,
            });
            if let Some(e) = acc.evidence {
                evidence.insert(candidate.identity_id, e);
            }
        }

        AggregateResult {
            tallies,
            evidence,
            frames: self.frames,
            unknown_faces: self.unknown_faces,
        }
    }
}

/// Result of processing one session video.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    /// Frames decoded and run through face matching.
    pub frames_sampled: u64,
    /// Frames that could not be decoded or analyzed. Not part of `frames_sampled`.
    pub frames_skipped: u64,
    pub unknown_faces: u64,
    pub present_count: usize,
    pub absent_count: usize,
    pub tallies: Vec<SessionTally>,
}

impl SessionReport {
    fn new(session_id: &str, aggregate: AggregateResult, frames_skipped: u64) -> Self {
        let present_count = aggregate
            .tallies
            .iter()
            .filter(|t| t.status != TallyStatus::Absent)
            .count();
        Self {
            session_id: session_id.to_string(),
            frames_sampled: aggregate.frames,
            frames_skipped,
            unknown_faces: aggregate.unknown_faces,
            present_count,
            absent_count: aggregate.tallies.len() - present_count,
            tallies: aggregate.tallies,
        }
    }
}

/// Video → tallies for one session, end to end.
pub struct SessionPipeline {
    pub extractor: Arc<dyn FaceExtractor>,
    pub frames: Arc<dyn FrameExtractor>,
    pub store: Arc<dyn AttendanceStore>,
    pub emotion: Option<Arc<dyn EmotionClassifier>>,
    pub policy: AttendancePolicy,
    pub sample_rate_hz: f64,
    pub evidence_dir: Option<PathBuf>,
}

impl SessionPipeline {
    /// Sample `video`, aggregate against the session roster and store the tallies.
    ///
    /// Nothing is written if the task is cancelled or a model error ends the run.
    pub fn run(&self, ctx: &TaskContext, session_id: &str, video: &Path) -> Result<SessionReport, PipelineFailure> {
        let roster = self.store.roster(session_id)?;
        if roster.is_empty() {
            tracing::warn!(session_id, "session roster is empty");
        }
        let registered = roster.iter().filter(|c| c.embedding.is_some()).count();

        let stop = ctx.cancel_token().stop_signal();
        let mut frames = FrameSampler::open(video, self.sample_rate_hz, self.frames.as_ref(), &stop)?;
        tracing::info!(
            task_id = %ctx.id(),
            session_id,
            roster = roster.len(),
            registered,
            rate_hz = self.sample_rate_hz,
            "processing session video"
        );

        let mut aggregator =
            AttendanceAggregator::new(roster, self.policy).keep_evidence_crops(self.evidence_dir.is_some());
        if let Some(classifier) = &self.emotion {
            aggregator = aggregator.with_emotion(classifier.clone());
        }

        let mut undetectable = 0u64;
        while let Some(frame) = frames.next() {
            ctx.checkpoint()?;
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    let skipped = frames.skipped() as u64 + undetectable;
                    let partial = SessionReport::new(session_id, aggregator.finish(), skipped);
                    return Err(PipelineFailure::with_partial(
                        PipelineError::Video(e),
                        TaskOutput::Attendance(partial),
                    ));
                }
            };
            match self.extractor.extract(&frame.image) {
                Ok(detections) => {
                    aggregator.observe(&frame, &detections);
                }
                Err(e) if e.is_item_level() => {
                    undetectable += 1;
                    tracing::warn!(session_id, frame = frame.index, error = %e, "skipping frame");
                }
                Err(e) => {
                    let skipped = frames.skipped() as u64 + undetectable;
                    let partial = SessionReport::new(session_id, aggregator.finish(), skipped);
                    return Err(PipelineFailure::with_partial(
                        PipelineError::Model(e),
                        TaskOutput::Attendance(partial),
                    ));
                }
            }
            // Progress is reported once the decoder knows the video's length
            if let Some(total) = frames.expected_total() {
                ctx.set_progress(frames.position(), total.max(frames.position() + 1));
            }
        }
        // A stopped decoder ends the stream early, so this also catches cancellation
        ctx.checkpoint()?;

        let skipped = frames.skipped() as u64 + undetectable;
        let mut aggregate = aggregator.finish();
        if let Some(dir) = &self.evidence_dir {
            write_evidence(dir, session_id, &mut aggregate);
        }

        self.store.replace_tallies(session_id, &aggregate.tallies)?;
        let mut report = SessionReport::new(session_id, aggregate, skipped);
        report.tallies = self.store.tallies(session_id)?;
        report.present_count = report
            .tallies
            .iter()
            .filter(|t| t.status != TallyStatus::Absent)
            .count();
        report.absent_count = report.tallies.len() - report.present_count;

        tracing::info!(
            task_id = %ctx.id(),
            session_id,
            present = report.present_count,
            absent = report.absent_count,
            unknown_faces = report.unknown_faces,
            skipped = report.frames_skipped,
            "session processed"
        );
        Ok(report)
    }
}

/// Save evidence crops as `<session>_<identity>_<frame>.jpg` and point tallies at them.
///
/// A crop that cannot be written keeps its frame reference.
fn write_evidence(dir: &Path, session_id: &str, aggregate: &mut AggregateResult) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "cannot create evidence directory");
        return;
    }
    for tally in &mut aggregate.tallies {
        let Some(evidence) = aggregate.evidence.get(&tally.identity_id) else {
            continue;
        };
        let Some(crop) = &evidence.crop else {
            continue;
        };
        let name = format!(
            "{}_{}_{}.jpg",
            file_safe(session_id),
            file_safe(&tally.identity_id),
            evidence.frame_index
        );
        let path = dir.join(name);
        match crop.save_with_format(&path, image::ImageFormat::Jpeg) {
            Ok(()) => tally.evidence_reference = Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                tracing::warn!(identity_id = %tally.identity_id, error = %e, "cannot write evidence image")
            }
        }
    }
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edusense_core::emotion::EmotionError;
    use edusense_core::Embedding;

    fn axis(i: usize) -> Embedding {
        let mut values = vec![0.0; 4];
        values[i] = 1.0;
        Embedding::new(values)
    }

    fn roster() -> Vec<Candidate> {
        vec![
            Candidate {
                identity_id: "alice".into(),
                embedding: Some(axis(0)),
            },
            Candidate {
                identity_id: "bob".into(),
                embedding: Some(axis(1)),
            },
            Candidate {
                identity_id: "carol".into(),
                embedding: None,
            },
        ]
    }

    fn frame(index: u64) -> SampledFrame {
        SampledFrame {
            index,
            timestamp: Duration::from_secs(index),
            image: RgbImage::new(64, 64),
        }
    }

    fn face(x: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 4.0,
            width: 20.0,
            height: 20.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    fn with_confidence(mut detection: Detection, confidence: f32) -> Detection {
        detection.face.confidence = confidence;
        detection
    }

    /// Detection whose embedding has cosine `similarity` with axis `i`.
    fn seen(i: usize, similarity: f32) -> Detection {
        let mut values = vec![0.0; 4];
        values[i] = similarity;
        values[3] = (1.0 - similarity * similarity).sqrt();
        Detection {
            face: face(2.0),
            embedding: Embedding::new(values),
        }
    }

    fn stranger() -> Detection {
        Detection {
            face: face(30.0),
            embedding: axis(3),
        }
    }

    fn status_of<'a>(result: &'a AggregateResult, id: &str) -> &'a SessionTally {
        result.tallies.iter().find(|t| t.identity_id == id).unwrap()
    }

    #[test]
    fn test_every_enrolled_identity_gets_a_tally() {
        let mut agg = AttendanceAggregator::new(roster(), AttendancePolicy::default());
        agg.observe(&frame(0), &[seen(0, 0.9), stranger()]);
        let result = agg.finish();

        let ids: Vec<&str> = result.tallies.iter().map(|t| t.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
        assert_eq!(status_of(&result, "alice").status, TallyStatus::Present);
        assert_eq!(status_of(&result, "bob").status, TallyStatus::Absent);
        assert_eq!(status_of(&result, "carol").status, TallyStatus::Absent);
        assert_eq!(result.unknown_faces, 1);
    }

    #[test]
    fn test_absent_iff_zero_appearances() {
        let mut agg = AttendanceAggregator::new(roster(), AttendancePolicy::default());
        for i in 0..5 {
            let dets = if i % 2 == 0 { vec![seen(1, 0.8)] } else { vec![] };
            agg.observe(&frame(i), &dets);
        }
        let result = agg.finish();
        for tally in &result.tallies {
            assert_eq!(tally.appearance_count == 0, tally.status == TallyStatus::Absent);
        }
        assert_eq!(status_of(&result, "bob").appearance_count, 3);
    }

    #[test]
    fn test_counts_once_per_frame() {
        let mut agg = AttendanceAggregator::new(roster(), AttendancePolicy::default());
        agg.observe(&frame(0), &[seen(0, 0.9), seen(0, 0.7)]);
        agg.observe(&frame(1), &[seen(0, 0.65)]);
        let result = agg.finish();
        assert_eq!(status_of(&result, "alice").appearance_count, 2);
    }

    #[test]
    fn test_below_threshold_is_unknown() {
        let mut agg = AttendanceAggregator::new(roster(), AttendancePolicy::default());
        let summary = agg.observe(&frame(0), &[seen(0, 0.55)]);
        assert_eq!(summary, FrameSummary { faces: 1, matched: 0, unknown: 1 });
        let result = agg.finish();
        assert_eq!(status_of(&result, "alice").status, TallyStatus::Absent);
    }

    #[test]
    fn test_evidence_is_most_confident_detection_first_wins_ties() {
        let mut agg = AttendanceAggregator::new(roster(), AttendancePolicy::default());
        agg.observe(&frame(0), &[with_confidence(seen(0, 0.95), 0.6)]);
        agg.observe(&frame(1), &[with_confidence(seen(0, 0.7), 0.9)]);
        agg.observe(&frame(2), &[with_confidence(seen(0, 0.9), 0.9)]);
        agg.observe(&frame(3), &[with_confidence(seen(0, 0.99), 0.8)]);
        let result = agg.finish();

        // Highest match score is frame 3, but frame 1 has the clearest face
        let evidence = &result.evidence["alice"];
        assert_eq!(evidence.frame_index, 1);
        assert_eq!(evidence.confidence, 0.9);
        assert!((evidence.similarity - 0.7).abs() < 1e-5);
        assert_eq!(
            status_of(&result, "alice").evidence_reference.as_deref(),
            Some("frame:1@1000ms")
        );
        assert!(status_of(&result, "bob").evidence_reference.is_none());
    }

    #[test]
    fn test_min_appearances_gates_present() {
        let policy = AttendancePolicy {
            min_appearances: 3,
            ..AttendancePolicy::default()
        };
        let mut agg = AttendanceAggregator::new(roster(), policy);
        for i in 0..3 {
            agg.observe(&frame(i), &[seen(0, 0.9)]);
        }
        for i in 3..5 {
            agg.observe(&frame(i), &[seen(1, 0.9)]);
        }
        let result = agg.finish();
        assert_eq!(status_of(&result, "alice").status, TallyStatus::Present);
        let bob = status_of(&result, "bob");
        assert_eq!(bob.appearance_count, 2);
        assert_eq!(bob.status, TallyStatus::Absent);
    }

    #[test]
    fn test_deterministic() {
        let run = || {
            let mut agg = AttendanceAggregator::new(roster(), AttendancePolicy::default());
            agg.observe(&frame(0), &[seen(0, 0.9), seen(1, 0.61), stranger()]);
            agg.observe(&frame(1), &[seen(1, 0.95)]);
            agg.finish().tallies
        };
        assert_eq!(run(), run());
    }

    /// Labels faces by their horizontal position in the frame.
    struct PositionLabels;

    impl EmotionClassifier for PositionLabels {
        fn classify(&self, face: &RgbImage) -> Result<String, EmotionError> {
            Ok(if face.get_pixel(0, 0).0[0] > 100 {
                "happiness".into()
            } else {
                "neutral".into()
            })
        }
    }

    #[test]
    fn test_dominant_emotion_ties_keep_first_seen() {
        let policy = AttendancePolicy {
            emotion_enabled: true,
            ..AttendancePolicy::default()
        };
        let mut agg = AttendanceAggregator::new(roster(), policy).with_emotion(Arc::new(PositionLabels));

        let bright = SampledFrame {
            image: RgbImage::from_pixel(64, 64, image::Rgb([200, 200, 200])),
            ..frame(1)
        };
        agg.observe(&frame(0), &[seen(0, 0.9)]);
        agg.observe(&bright, &[seen(0, 0.9), seen(1, 0.9)]);
        agg.observe(&frame(2), &[seen(1, 0.9)]);
        agg.observe(&frame(3), &[seen(1, 0.9)]);
        let result = agg.finish();

        // alice: neutral, happiness (tie); bob: happiness, neutral, neutral

        assert_eq!(status_of(&result, "alice").dominant_emotion.as_deref(), Some("neutral"));
        assert_eq!(status_of(&result, "bob").dominant_emotion.as_deref(), Some("neutral"));
        assert!(status_of(&result, "carol").dominant_emotion.is_none());
    }

    #[test]
    fn test_emotion_disabled_leaves_label_empty() {
        let mut agg = AttendanceAggregator::new(roster(), AttendancePolicy::default())
            .with_emotion(Arc::new(PositionLabels));
        agg.observe(&frame(0), &[seen(0, 0.9)]);
        assert!(agg.finish().tallies[0].dominant_emotion.is_none());
    }

    #[test]
    fn test_evidence_crops_written() {
        let mut agg = AttendanceAggregator::new(roster(), AttendancePolicy::default()).keep_evidence_crops(true);
        agg.observe(&frame(4), &[seen(0, 0.9)]);
        let mut result = agg.finish();
        assert!(result.evidence["alice"].crop.is_some());

        let dir = tempfile::tempdir().unwrap();
        write_evidence(dir.path(), "IF-101/2025", &mut result);
        let reference = status_of(&result, "alice").evidence_reference.clone().unwrap();
        assert!(reference.ends_with("IF-101_2025_alice_4.jpg"), "{reference}");
        assert!(Path::new(&reference).exists());
    }

    #[test]
    fn test_status_strings() {
        for status in [TallyStatus::Present, TallyStatus::Absent, TallyStatus::ManuallyOverridden] {
            assert_eq!(status.as_str().parse::<TallyStatus>().unwrap(), status);
            assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{}\"", status.as_str()));
        }
    }
}
