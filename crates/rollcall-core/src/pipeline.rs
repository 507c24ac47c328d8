//! One detection tick: gate the faces, recognize the single subject if any,
//! and feed the outcome to the attendance session.

use crate::extractor::{FeatureExtractor, FrameSample};
use crate::gate::{DetectionGate, DetectionState};
use crate::matcher::Matcher;
use crate::session::AttendanceSession;
use crate::types::{FaceBox, Identity, RecognitionResult};
use chrono::{DateTime, Local};

/// What one tick concluded.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub state: DetectionState,
    pub face_count: usize,
    pub recognition: RecognitionResult,
}

/// Components that stay fixed for the lifetime of a detection loop.
pub struct Recognizer<M: Matcher> {
    gate: DetectionGate,
    extractor: FeatureExtractor,
    matcher: M,
    threshold: f32,
}

impl<M: Matcher> Recognizer<M> {
    pub fn new(matcher: M, threshold: f32) -> Self {
        Self {
            gate: DetectionGate::new(),
            extractor: FeatureExtractor,
            matcher,
            threshold,
        }
    }

    pub fn state(&self) -> DetectionState {
        self.gate.state()
    }

    pub fn reset(&mut self) {
        self.gate.reset();
    }

    /// Gate and recognize one frame without touching any session.
    ///
    /// A degenerate face box skips recognition for this frame only.
    pub fn recognize<F: FrameSample + ?Sized>(
        &mut self,
        frame: &F,
        faces: &[FaceBox],
        gallery: &[Identity],
    ) -> FrameOutcome {
        let face_count = faces.len();
        let recognition = match self.gate.advance(faces) {
            Some(face) => match self.extractor.extract(frame, face) {
                Ok(probe) => self.matcher.compare(&probe, gallery, self.threshold),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping recognition for this frame");
                    RecognitionResult::NoMatch
                }
            },
            None => RecognitionResult::NoMatch,
        };

        FrameOutcome {
            state: self.gate.state(),
            face_count,
            recognition,
        }
    }

    /// Run a full tick: recognize, then record the outcome in `session`.
    pub fn tick<F: FrameSample + ?Sized>(
        &mut self,
        frame: &F,
        faces: &[FaceBox],
        gallery: &[Identity],
        session: &mut AttendanceSession,
        now: DateTime<Local>,
    ) -> FrameOutcome {
        let outcome = self.recognize(frame, faces, gallery);
        session.observe_at(outcome.state, outcome.recognition.clone(), now);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::test_frames::RgbFrame;
    use crate::gallery::GalleryStore;
    use crate::matcher::{CosineMatcher, DEFAULT_THRESHOLD};
    use crate::report;
    use crate::session::CommitRejection;
    use chrono::Duration;

    fn enroll_from_frame(gallery: &mut GalleryStore, frame: &RgbFrame, face: &FaceBox, name: &str, id: &str) {
        let embedding = FeatureExtractor.extract(frame, face).unwrap();
        gallery
            .enroll(Identity {
                display_name: name.into(),
                external_id: Some(id.into()),
                embedding,
                enrolled_at: "1/1/2024".into(),
                record_id: 1,
            })
            .unwrap();
    }

    #[test]
    fn test_enroll_recognize_commit() {
        let frame = RgbFrame::gradient(320, 240);
        let face = FaceBox::new((40.0, 30.0), (200.0, 210.0));
        let mut gallery = GalleryStore::new();
        enroll_from_frame(&mut gallery, &frame, &face, "Priya", "US001");

        let mut recognizer = Recognizer::new(CosineMatcher, DEFAULT_THRESHOLD);
        let mut session = AttendanceSession::new();
        session.start();

        let now = Local::now();
        let outcome = recognizer.tick(&frame, &[face], gallery.all(), &mut session, now);
        assert_eq!(outcome.state, DetectionState::Single);
        match &outcome.recognition {
            RecognitionResult::Matched { identity, similarity } => {
                assert_eq!(identity.display_name, "Priya");
                assert!((similarity - 1.0).abs() < 1e-6);
            }
            RecognitionResult::NoMatch => panic!("expected a match"),
        }

        let today = report::attendance_day(&now);
        let record = session
            .commit_at(&today, &[], now + Duration::milliseconds(500))
            .unwrap();
        assert_eq!(record.display_name, "Priya");
        assert_eq!(record.external_id, "US001");
        assert_eq!(record.date, today);
    }

    #[test]
    fn test_crowded_frame_clears_prior_match() {
        let frame = RgbFrame::gradient(320, 240);
        let face = FaceBox::new((40.0, 30.0), (200.0, 210.0));
        let other = FaceBox::new((220.0, 30.0), (300.0, 120.0));
        let mut gallery = GalleryStore::new();
        enroll_from_frame(&mut gallery, &frame, &face, "Priya", "US001");

        let mut recognizer = Recognizer::new(CosineMatcher, DEFAULT_THRESHOLD);
        let mut session = AttendanceSession::new();
        session.start();
        let now = Local::now();

        recognizer.tick(&frame, &[face], gallery.all(), &mut session, now);
        assert!(session.last_observation().is_some());

        let outcome = recognizer.tick(&frame, &[face, other], gallery.all(), &mut session, now);
        assert_eq!(outcome.state, DetectionState::Crowded);
        assert_eq!(outcome.recognition, RecognitionResult::NoMatch);
        assert!(session.last_observation().is_none());
        assert_eq!(
            session.commit_at("any", &[], now),
            Err(CommitRejection::NoRecentMatch)
        );
    }

    #[test]
    fn test_degenerate_box_yields_no_match() {
        let frame = RgbFrame::gradient(64, 64);
        let flat = FaceBox::new((10.0, 10.0), (10.0, 40.0));
        let mut recognizer = Recognizer::new(CosineMatcher, DEFAULT_THRESHOLD);
        let outcome = recognizer.recognize(&frame, &[flat], &[]);
        assert_eq!(outcome.state, DetectionState::Single);
        assert_eq!(outcome.recognition, RecognitionResult::NoMatch);
    }

    #[test]
    fn test_empty_frame() {
        let frame = RgbFrame::gradient(64, 64);
        let mut recognizer = Recognizer::new(CosineMatcher, DEFAULT_THRESHOLD);
        let outcome = recognizer.recognize(&frame, &[], &[]);
        assert_eq!(outcome.state, DetectionState::Empty);
        assert_eq!(outcome.face_count, 0);
    }
}
