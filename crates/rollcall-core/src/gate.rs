//! Single-subject policy: recognition runs only when exactly one face is in view.

use crate::types::FaceBox;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionState {
    /// No face in the frame.
    #[default]
    Empty,
    /// Exactly one face; recognition may proceed.
    Single,
    /// Two or more faces. Nobody is recognized, even a face that would match.
    Crowded,
}

impl DetectionState {
    pub fn from_face_count(count: usize) -> Self {
        match count {
            0 => DetectionState::Empty,
            1 => DetectionState::Single,
            _ => DetectionState::Crowded,
        }
    }
}

/// Tracks the detection state of the most recent frame.
///
/// There is no hysteresis: each call to [`advance`](Self::advance) depends
/// only on that frame's face count.
#[derive(Debug, Default)]
pub struct DetectionGate {
    state: DetectionState,
    face_count: usize,
}

impl DetectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to the state implied by this frame's faces. Returns the face to
    /// recognize when exactly one is present.
    pub fn advance<'a>(&mut self, faces: &'a [FaceBox]) -> Option<&'a FaceBox> {
        let next = DetectionState::from_face_count(faces.len());
        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, faces = faces.len(), "detection state changed");
        }
        self.state = next;
        self.face_count = faces.len();

        match next {
            DetectionState::Single => faces.first(),
            DetectionState::Empty | DetectionState::Crowded => None,
        }
    }

    /// Back to `Empty`, e.g. when the camera stops.
    pub fn reset(&mut self) {
        self.state = DetectionState::Empty;
        self.face_count = 0;
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn face_count(&self) -> usize {
        self.face_count
    }

    pub fn permits_recognition(&self) -> bool {
        self.state == DetectionState::Single
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32) -> FaceBox {
        FaceBox::new((x, 0.0), (x + 50.0, 50.0))
    }

    #[test]
    fn test_state_from_count() {
        assert_eq!(DetectionState::from_face_count(0), DetectionState::Empty);
        assert_eq!(DetectionState::from_face_count(1), DetectionState::Single);
        assert_eq!(DetectionState::from_face_count(2), DetectionState::Crowded);
        assert_eq!(DetectionState::from_face_count(7), DetectionState::Crowded);
    }

    #[test]
    fn test_single_face_passes() {
        let mut gate = DetectionGate::new();
        let faces = [face(10.0)];
        assert_eq!(gate.advance(&faces), Some(&faces[0]));
        assert!(gate.permits_recognition());
    }

    #[test]
    fn test_crowded_blocks() {
        let mut gate = DetectionGate::new();
        let faces = [face(10.0), face(100.0)];
        assert!(gate.advance(&faces).is_none());
        assert_eq!(gate.state(), DetectionState::Crowded);
        assert_eq!(gate.face_count(), 2);
        assert!(!gate.permits_recognition());
    }

    #[test]
    fn test_no_hysteresis() {
        let mut gate = DetectionGate::new();
        gate.advance(&[face(0.0), face(100.0)]);
        assert!(gate.advance(&[face(0.0)]).is_some());
        assert!(gate.advance(&[]).is_none());
        assert_eq!(gate.state(), DetectionState::Empty);
    }

    #[test]
    fn test_reset() {
        let mut gate = DetectionGate::new();
        gate.advance(&[face(0.0)]);
        gate.reset();
        assert_eq!(gate.state(), DetectionState::Empty);
        assert!(!gate.permits_recognition());
    }
}
