use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::Serialize;

use crate::geometry::{IntRect, IntSize};

/// Kind of continuous gesture the viewport is animating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContinuousTransformType {
    /// Pinch or double-tap zoom
    Scale,
    /// Drag
    Offset,
    Rotate,
    /// Inertial scroll after a drag
    Fling,
    /// Animated move to a given point
    Locate,
}

bitflags! {
    /// Set of [`ContinuousTransformType`]s.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContinuousTransformTypes: u8 {
        const SCALE = 1 << 0;
        const OFFSET = 1 << 1;
        const ROTATE = 1 << 2;
        const FLING = 1 << 3;
        const LOCATE = 1 << 4;
    }
}

impl ContinuousTransformType {
    pub fn flag(&self) -> ContinuousTransformTypes {
        match self {
            ContinuousTransformType::Scale => ContinuousTransformTypes::SCALE,
            ContinuousTransformType::Offset => ContinuousTransformTypes::OFFSET,
            ContinuousTransformType::Rotate => ContinuousTransformTypes::ROTATE,
            ContinuousTransformType::Fling => ContinuousTransformTypes::FLING,
            ContinuousTransformType::Locate => ContinuousTransformTypes::LOCATE,
        }
    }
}

impl ContinuousTransformTypes {
    /// Gestures during which tiles are not recomputed by default: zooming
    /// and locate animations.
    pub const DEFAULT_PAUSED: ContinuousTransformTypes =
        ContinuousTransformTypes::SCALE.union(ContinuousTransformTypes::LOCATE);

    pub fn contains_type(&self, kind: ContinuousTransformType) -> bool {
        self.contains(kind.flag())
    }
}

impl Default for ContinuousTransformTypes {
    fn default() -> Self {
        Self::DEFAULT_PAUSED
    }
}

impl FromStr for ContinuousTransformTypes {
    type Err = String;

    /// Comma separated names, `none` or `all`: `"scale,fling"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut types = ContinuousTransformTypes::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            types |= match name.to_ascii_lowercase().as_str() {
                "none" => ContinuousTransformTypes::empty(),
                "all" => ContinuousTransformTypes::all(),
                "scale" => ContinuousTransformTypes::SCALE,
                "offset" => ContinuousTransformTypes::OFFSET,
                "rotate" => ContinuousTransformTypes::ROTATE,
                "fling" => ContinuousTransformTypes::FLING,
                "locate" => ContinuousTransformTypes::LOCATE,
                other => return Err(format!("unknown transform type '{}'", other)),
            };
        }
        Ok(types)
    }
}

impl fmt::Display for ContinuousTransformTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// Viewport state reported by the pan/zoom collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportState {
    /// Size of the view on screen
    pub container_size: IntSize,
    /// Part of the content (the thumbnail before scaling) currently visible
    pub content_visible_rect: IntRect,
    /// Current zoom, relative to the content size
    pub scale: f32,
    /// Zoom at which the content fits the container; no tiles at or below it
    pub min_scale: f32,
    /// User rotation in degrees (0, 90, 180 or 270); applied by the renderer
    pub rotation: u16,
    /// Gesture in progress, if any
    pub continuous_transform: Option<ContinuousTransformType>,
}

impl ViewportState {
    pub fn new(container_size: IntSize, content_visible_rect: IntRect, scale: f32) -> Self {
        Self {
            container_size,
            content_visible_rect,
            scale,
            min_scale: 1.0,
            rotation: 0,
            continuous_transform: None,
        }
    }

    /// Viewport zoomed to `scale` around `focus`, given as fractions of the
    /// content (`(0.5, 0.5)` is the center). The content is laid out to fit
    /// the container at scale 1.
    pub fn focused(container_size: IntSize, content_size: IntSize, scale: f32, focus: (f32, f32)) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        let visible = |container: u32, content: u32| -> u32 {
            ((container as f64 / scale as f64).ceil() as u32).clamp(1, content.max(1))
        };
        let start = |fraction: f32, visible: u32, content: u32| -> u32 {
            let center = fraction.clamp(0.0, 1.0) as f64 * content as f64;
            let start = (center - visible as f64 / 2.0).round().max(0.0) as u32;
            start.min(content.saturating_sub(visible))
        };

        let width = visible(container_size.width, content_size.width);
        let height = visible(container_size.height, content_size.height);
        let left = start(focus.0, width, content_size.width);
        let top = start(focus.1, height, content_size.height);

        Self::new(
            container_size,
            IntRect::new(left, top, left + width, top + height),
            scale,
        )
    }

    pub fn with_min_scale(mut self, min_scale: f32) -> Self {
        self.min_scale = min_scale;
        self
    }

    pub fn with_rotation(mut self, rotation: u16) -> Self {
        self.rotation = rotation % 360;
        self
    }

    pub fn with_continuous_transform(mut self, kind: Option<ContinuousTransformType>) -> Self {
        self.continuous_transform = kind;
        self
    }

    /// Whether the gesture in progress is one of `paused`.
    pub fn is_paused_by(&self, paused: ContinuousTransformTypes) -> bool {
        self.continuous_transform
            .is_some_and(|kind| paused.contains_type(kind))
    }
}
