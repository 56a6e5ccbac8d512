//! Reference frames and the frame hierarchy.
//!
//! Frames form a rooted tree with the anatomical frame as root:
//! native slab -> slab-reference -> whole-volume -> anatomical. The
//! slab-reference and whole-volume families exist in a distorted and a
//! distortion-corrected state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a functional frame has had susceptibility distortion removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionState {
    /// Raw EPI geometry.
    Distorted,
    /// After applying the run's distortion field.
    Corrected,
}

impl DistortionState {
    /// The state a link configured with `undistorted` is estimated in.
    #[must_use]
    pub const fn from_undistorted(undistorted: bool) -> Self {
        if undistorted {
            Self::Corrected
        } else {
            Self::Distorted
        }
    }

    /// The other state.
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Distorted => Self::Corrected,
            Self::Corrected => Self::Distorted,
        }
    }
}

impl fmt::Display for DistortionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Distorted => write!(f, "distorted"),
            Self::Corrected => write!(f, "corrected"),
        }
    }
}

/// A frame family: every functional frame belongs to one, the anatomical frame has none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "family", content = "run")]
pub enum FrameFamily {
    /// A slab run's own frame, keyed by its run identifier.
    NativeSlab(String),
    /// The slab-reference run's frame.
    SlabReference,
    /// The whole-volume run's frame.
    WholeVolume,
}

impl FrameFamily {
    /// The frame of this family in the given state.
    #[must_use]
    pub fn at(&self, state: DistortionState) -> ReferenceFrame {
        match self {
            Self::NativeSlab(run) => ReferenceFrame::NativeSlab {
                run: run.clone(),
                state,
            },
            Self::SlabReference => ReferenceFrame::SlabReference(state),
            Self::WholeVolume => ReferenceFrame::WholeVolume(state),
        }
    }

    /// The next family up the hierarchy, `None` when the parent is the anatomical frame.
    #[must_use]
    pub const fn parent(&self) -> Option<Self> {
        match self {
            Self::NativeSlab(_) => Some(Self::SlabReference),
            Self::SlabReference => Some(Self::WholeVolume),
            Self::WholeVolume => None,
        }
    }
}

/// A named coordinate space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceFrame {
    /// The structural image space; root of the hierarchy.
    Anatomical,
    /// The whole-volume functional reference.
    WholeVolume(DistortionState),
    /// The slab-reference run.
    SlabReference(DistortionState),
    /// A slab run's own space.
    NativeSlab {
        /// Run identifier.
        run: String,
        /// Distortion state.
        state: DistortionState,
    },
}

impl ReferenceFrame {
    /// The family of a functional frame.
    #[must_use]
    pub fn family(&self) -> Option<FrameFamily> {
        match self {
            Self::Anatomical => None,
            Self::WholeVolume(_) => Some(FrameFamily::WholeVolume),
            Self::SlabReference(_) => Some(FrameFamily::SlabReference),
            Self::NativeSlab { run, .. } => Some(FrameFamily::NativeSlab(run.clone())),
        }
    }

    /// The distortion state of a functional frame.
    #[must_use]
    pub const fn state(&self) -> Option<DistortionState> {
        match self {
            Self::Anatomical => None,
            Self::WholeVolume(s) | Self::SlabReference(s) | Self::NativeSlab { state: s, .. } => Some(*s),
        }
    }

    /// Depth from the root (anatomical = 0).
    #[must_use]
    pub const fn depth(&self) -> usize {
        match self {
            Self::Anatomical => 0,
            Self::WholeVolume(_) => 1,
            Self::SlabReference(_) => 2,
            Self::NativeSlab { .. } => 3,
        }
    }
}

impl fmt::Display for ReferenceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anatomical => write!(f, "anatomical"),
            Self::WholeVolume(s) => write!(f, "whole-volume-{s}"),
            Self::SlabReference(s) => write!(f, "slab-reference-{s}"),
            Self::NativeSlab { run, state } => write!(f, "native-slab[{run}]-{state}"),
        }
    }
}

/// One step of a planned native-to-anatomical chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlannedLink {
    /// A family's distortion field, applied forward (distorted -> corrected)
    /// or inverted (corrected -> distorted).
    Distortion {
        /// The family whose field is used.
        family: FrameFamily,
        /// True for corrected -> distorted.
        inverse: bool,
    },
    /// A registration from one family to its parent, estimated in `state`.
    Registration {
        /// Moving family.
        family: FrameFamily,
        /// Distortion state both images were in when registered.
        state: DistortionState,
    },
}

impl PlannedLink {
    /// Frame the link maps from.
    #[must_use]
    pub fn source(&self) -> ReferenceFrame {
        match self {
            Self::Distortion { family, inverse } => {
                family.at(if *inverse { DistortionState::Corrected } else { DistortionState::Distorted })
            }
            Self::Registration { family, state } => family.at(*state),
        }
    }

    /// Frame the link maps to.
    #[must_use]
    pub fn target(&self) -> ReferenceFrame {
        match self {
            Self::Distortion { family, inverse } => {
                family.at(if *inverse { DistortionState::Distorted } else { DistortionState::Corrected })
            }
            Self::Registration { family, state } => family
                .parent()
                .map_or(ReferenceFrame::Anatomical, |p| p.at(*state)),
        }
    }
}

/// Distortion states the three registration links are estimated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStates {
    /// Slab to slab-reference.
    pub slab_to_slabref: DistortionState,
    /// Slab-reference to whole-volume.
    pub slabref_to_whole: DistortionState,
    /// Whole-volume to anatomical.
    pub whole_to_anat: DistortionState,
}

impl LinkStates {
    /// All links distorted.
    #[must_use]
    pub const fn distorted() -> Self {
        Self {
            slab_to_slabref: DistortionState::Distorted,
            slabref_to_whole: DistortionState::Distorted,
            whole_to_anat: DistortionState::Distorted,
        }
    }

    /// All links corrected.
    #[must_use]
    pub const fn corrected() -> Self {
        Self {
            slab_to_slabref: DistortionState::Corrected,
            slabref_to_whole: DistortionState::Corrected,
            whole_to_anat: DistortionState::Corrected,
        }
    }

    const fn for_family(&self, family: &FrameFamily) -> DistortionState {
        match family {
            FrameFamily::NativeSlab(_) => self.slab_to_slabref,
            FrameFamily::SlabReference => self.slabref_to_whole,
            FrameFamily::WholeVolume => self.whole_to_anat,
        }
    }
}

/// Plans the chain of links mapping a functional family's distorted frame to the anatomical frame.
///
/// Whenever the next registration is estimated in a different state than
/// the chain is in, the current family's distortion field (or its inverse)
/// is inserted first.
#[must_use]
pub fn plan_chain(start: &FrameFamily, states: LinkStates) -> Vec<PlannedLink> {
    plan_chain_from(start, DistortionState::Distorted, states)
}

/// Like [`plan_chain`], starting from `start` in the given state.
#[must_use]
pub fn plan_chain_from(start: &FrameFamily, start_state: DistortionState, states: LinkStates) -> Vec<PlannedLink> {
    let mut links: Vec<PlannedLink> = Vec::new();
    let mut family = start.clone();
    let mut state = start_state;

    loop {
        let wanted = states.for_family(&family);
        if wanted != state {
            links.push(PlannedLink::Distortion {
                family: family.clone(),
                inverse: state == DistortionState::Corrected,
            });
            state = wanted;
        }
        links.push(PlannedLink::Registration {
            family: family.clone(),
            state,
        });
        match family.parent() {
            Some(parent) => family = parent,
            None => break,
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn slab() -> FrameFamily {
        FrameFamily::NativeSlab("task-motor_run-01".into())
    }

    fn assert_continuous(links: &[PlannedLink], start: &ReferenceFrame) {
        let mut current = start.clone();
        for link in links {
            assert_eq!(link.source(), current);
            current = link.target();
        }
        assert_eq!(current, ReferenceFrame::Anatomical);
    }

    #[test]
    fn test_all_corrected_chain_has_leading_distortion_field() {
        let links = plan_chain(&slab(), LinkStates::corrected());
        assert_eq!(links.len(), 4);
        assert_eq!(
            links[0],
            PlannedLink::Distortion { family: slab(), inverse: false }
        );
        assert_continuous(&links, &slab().at(DistortionState::Distorted));
    }

    #[test]
    fn test_all_distorted_chain_omits_distortion() {
        let links = plan_chain(&slab(), LinkStates::distorted());
        assert_eq!(links.len(), 3);
        assert!(links
            .iter()
            .all(|l| matches!(l, PlannedLink::Registration { .. })));
        assert_continuous(&links, &slab().at(DistortionState::Distorted));
    }

    #[test]
    fn test_mixed_states_insert_bridges() {
        let states = LinkStates {
            whole_to_anat: DistortionState::Distorted,
            ..LinkStates::corrected()
        };
        let links = plan_chain(&slab(), states);
        assert_eq!(
            links[3],
            PlannedLink::Distortion { family: FrameFamily::WholeVolume, inverse: true }
        );
        assert_continuous(&links, &slab().at(DistortionState::Distorted));
    }

    #[test]
    fn test_slab_reference_chain_skips_slab_link() {
        let links = plan_chain(&FrameFamily::SlabReference, LinkStates::corrected());
        assert_eq!(links.len(), 3);
        assert_continuous(&links, &ReferenceFrame::SlabReference(DistortionState::Distorted));
    }

    #[test]
    fn test_chain_from_corrected_state_bridges_back() {
        let links = plan_chain_from(&FrameFamily::WholeVolume, DistortionState::Corrected, LinkStates::distorted());
        assert_eq!(
            links,
            vec![
                PlannedLink::Distortion { family: FrameFamily::WholeVolume, inverse: true },
                PlannedLink::Registration { family: FrameFamily::WholeVolume, state: DistortionState::Distorted },
            ]
        );
        assert_continuous(&links, &ReferenceFrame::WholeVolume(DistortionState::Corrected));
    }

    #[test]
    fn test_frame_display() {
        assert_eq!(ReferenceFrame::WholeVolume(DistortionState::Corrected).to_string(), "whole-volume-corrected");
        assert_eq!(ReferenceFrame::Anatomical.depth(), 0);
    }
}
