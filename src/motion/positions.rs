//! Named handler positions.

use crate::config::PositionOffsets;
use crate::measurement::Axis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named translation position along the handler tube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TranslationPosition {
    /// Home switch (pulse offset zero)
    Home,
    /// Sample loading position
    Load,
    /// Inside the X demagnetizer coil
    AfX,
    /// Inside the Y demagnetizer coil
    AfY,
    /// Inside the Z demagnetizer coil
    AfZ,
    /// Empty-tube background position below the sensors
    Background,
    /// Sample centred in the sensing region
    Measurement,
    /// Right limit switch
    RightLimit,
    /// Left limit switch
    LeftLimit,
}

impl TranslationPosition {
    /// Absolute pulse offset, or `None` for the limit switches.
    pub fn offset(self, offsets: &PositionOffsets) -> Option<i64> {
        match self {
            TranslationPosition::Home => Some(0),
            TranslationPosition::Load => Some(offsets.load),
            TranslationPosition::AfX => Some(offsets.af_x),
            TranslationPosition::AfY => Some(offsets.af_y),
            TranslationPosition::AfZ => Some(offsets.af_z),
            TranslationPosition::Background => Some(offsets.background),
            TranslationPosition::Measurement => Some(offsets.measurement),
            TranslationPosition::RightLimit | TranslationPosition::LeftLimit => None,
        }
    }

    /// Position inside the demagnetizer coil for `axis`.
    pub fn af(axis: Axis) -> Self {
        match axis {
            Axis::X => TranslationPosition::AfX,
            Axis::Y => TranslationPosition::AfY,
            Axis::Z => TranslationPosition::AfZ,
        }
    }

    /// Whether this is a limit switch.
    pub fn is_limit(self) -> bool {
        matches!(
            self,
            TranslationPosition::RightLimit | TranslationPosition::LeftLimit
        )
    }
}

impl fmt::Display for TranslationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TranslationPosition::Home => "home",
            TranslationPosition::Load => "load",
            TranslationPosition::AfX => "AF X",
            TranslationPosition::AfY => "AF Y",
            TranslationPosition::AfZ => "AF Z",
            TranslationPosition::Background => "background",
            TranslationPosition::Measurement => "measurement",
            TranslationPosition::RightLimit => "right limit",
            TranslationPosition::LeftLimit => "left limit",
        };
        f.write_str(s)
    }
}

/// Named rotation position, in quarter turns from home.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationPosition {
    /// 0°
    Home,
    /// 90°
    Deg90,
    /// 180°
    Deg180,
    /// 270°
    Deg270,
}

impl RotationPosition {
    /// Quarter turns from home, 0..=3.
    pub fn quarter(self) -> u8 {
        match self {
            RotationPosition::Home => 0,
            RotationPosition::Deg90 => 1,
            RotationPosition::Deg180 => 2,
            RotationPosition::Deg270 => 3,
        }
    }

    /// Position `k` quarter turns from home (modulo a full turn).
    pub fn from_quarter(k: usize) -> Self {
        match k % 4 {
            0 => RotationPosition::Home,
            1 => RotationPosition::Deg90,
            2 => RotationPosition::Deg180,
            _ => RotationPosition::Deg270,
        }
    }

    /// Angle in degrees.
    pub fn degrees(self) -> u16 {
        u16::from(self.quarter()) * 90
    }

    /// Quarter turns needed to reach `target` turning forward only.
    pub fn quarters_to(self, target: RotationPosition) -> u8 {
        (target.quarter() + 4 - self.quarter()) % 4
    }
}

impl fmt::Display for RotationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_have_no_offset() {
        let offsets = PositionOffsets::default();
        assert_eq!(TranslationPosition::Home.offset(&offsets), Some(0));
        assert_eq!(TranslationPosition::RightLimit.offset(&offsets), None);
        assert!(TranslationPosition::LeftLimit.is_limit());
    }

    #[test]
    fn rotation_turns_forward() {
        use RotationPosition::*;
        assert_eq!(Home.quarters_to(Deg180), 2);
        assert_eq!(Deg270.quarters_to(Home), 1);
        assert_eq!(Deg90.quarters_to(Deg90), 0);
        assert_eq!(RotationPosition::from_quarter(6), Deg180);
        assert_eq!(Deg270.to_string(), "270°");
    }
}
