//! Scale schedule.

pub use super::*;

use std::{fmt, str::FromStr};

/// Coarse-to-fine side lengths of the square token maps.
///
/// ## Details
///
/// The sides are non-zero and non-decreasing.
/// The last side equals the side of the full-resolution feature map.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScaleSchedule {
    sides: Vec<usize>,
}

use burn::constant;

constant!(ScaleSchedule);

impl ScaleSchedule {
    /// Build a validated schedule.
    pub fn new(sides: Vec<usize>) -> Result<Self, Error> {
        if sides.is_empty() {
            return Err(Error::Validation(
                "The scale count".into(),
                "at least 1".into(),
            ));
        }
        if let Some(side) = sides.iter().find(|side| **side == 0) {
            return Err(Error::Validation(
                format!("The side {side}"),
                "greater than 0".into(),
            ));
        }
        if let Some(pair) = sides.windows(2).find(|pair| pair[0] > pair[1]) {
            return Err(Error::Validation(
                format!("The sides {:?}", pair),
                "non-decreasing".into(),
            ));
        }

        Ok(Self { sides })
    }

    /// Number of scales, `SN`.
    #[inline]
    pub fn len(&self) -> usize {
        self.sides.len()
    }

    /// Always `false` for a validated schedule.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sides.is_empty()
    }

    #[inline]
    pub fn sides(&self) -> &[usize] {
        &self.sides
    }

    #[inline]
    pub fn side(
        &self,
        scale_index: usize,
    ) -> Option<usize> {
        self.sides.get(scale_index).copied()
    }

    /// Side of the full-resolution feature map.
    #[inline]
    pub fn side_max(&self) -> usize {
        self.sides.last().copied().unwrap_or_default()
    }

    #[inline]
    pub fn is_final(
        &self,
        scale_index: usize,
    ) -> bool {
        scale_index + 1 == self.len()
    }

    /// Token count of all scales, `L = sum(side^2)`.
    pub fn token_count(&self) -> usize {
        self.sides.iter().map(|side| side * side).sum()
    }

    /// Pixel resolutions of all scales, `side * patch_size`.
    pub fn resolutions(
        &self,
        patch_size: usize,
    ) -> Vec<usize> {
        self.sides.iter().map(|side| side * patch_size).collect()
    }

    /// Normalized position of the scale, `scale_index / (scale_count - 1)`.
    ///
    /// It is `0.0` for a single scale.
    #[inline]
    pub fn position(
        scale_index: usize,
        scale_count: usize,
    ) -> f64 {
        if scale_count <= 1 {
            return 0.0;
        }
        scale_index as f64 / (scale_count - 1) as f64
    }
}

/// Parsing from the form like `1_2_3_4_5_6_8_10_13_16` or `1-2-4`.
impl FromStr for ScaleSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sides = s
            .trim()
            .replace('-', "_")
            .split('_')
            .map(str::parse::<usize>)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(sides)
    }
}

impl fmt::Display for ScaleSchedule {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let sides = self
            .sides
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        f.write_str(&sides.join("_"))
    }
}

impl TryFrom<Vec<usize>> for ScaleSchedule {
    type Error = Error;

    #[inline]
    fn try_from(sides: Vec<usize>) -> Result<Self, Self::Error> {
        Self::new(sides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let schedule = "1_2_3_4_5_6_8_10_13_16".parse::<ScaleSchedule>().unwrap();
        assert_eq!(schedule.sides(), [1, 2, 3, 4, 5, 6, 8, 10, 13, 16]);
        assert_eq!(schedule.len(), 10);
        assert_eq!(schedule.side_max(), 16);
        assert_eq!(schedule.token_count(), 680);
        assert_eq!(schedule.to_string(), "1_2_3_4_5_6_8_10_13_16");

        let schedule = "1-2-4".parse::<ScaleSchedule>().unwrap();
        assert_eq!(schedule.sides(), [1, 2, 4]);
        assert_eq!(schedule.resolutions(16), [16, 32, 64]);
        assert!(schedule.is_final(2));
        assert!(!schedule.is_final(1));
    }

    #[test]
    fn invalid() {
        assert!(matches!(
            "1_x_3".parse::<ScaleSchedule>(),
            Err(Error::ParseInt(_))
        ));
        assert!(matches!(
            ScaleSchedule::new(vec![]),
            Err(Error::Validation(..))
        ));
        assert!(matches!(
            ScaleSchedule::new(vec![0, 1]),
            Err(Error::Validation(..))
        ));
        assert!(matches!(
            ScaleSchedule::new(vec![1, 4, 2]),
            Err(Error::Validation(..))
        ));
        assert!(ScaleSchedule::new(vec![1, 2, 2, 4]).is_ok());
    }

    #[test]
    fn position() {
        assert_eq!(ScaleSchedule::position(0, 1), 0.0);
        assert_eq!(ScaleSchedule::position(0, 5), 0.0);
        assert_eq!(ScaleSchedule::position(2, 5), 0.5);
        assert_eq!(ScaleSchedule::position(4, 5), 1.0);
    }
}
