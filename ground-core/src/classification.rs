use std::fmt;

/// Ground classification of a single point.
///
/// The numeric codes follow the ASPRS LAS classification table: `0` for points that were never
/// classified, `1` for processed points that are not ground and `2` for ground points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PointClass {
    #[default]
    NeverClassified,
    NonGround,
    Ground,
}

impl PointClass {
    /// Returns the LAS classification code of this class
    pub fn las_code(self) -> u8 {
        match self {
            PointClass::NeverClassified => 0,
            PointClass::NonGround => 1,
            PointClass::Ground => 2,
        }
    }

    /// Interprets a LAS classification code. Every code other than `0` and `2` counts as non-ground
    /// ```
    /// # use ground_core::classification::PointClass;
    /// assert_eq!(PointClass::from_las_code(2), PointClass::Ground);
    /// assert_eq!(PointClass::from_las_code(6), PointClass::NonGround);
    /// ```
    pub fn from_las_code(code: u8) -> Self {
        match code {
            0 => PointClass::NeverClassified,
            2 => PointClass::Ground,
            _ => PointClass::NonGround,
        }
    }

    pub fn is_ground(self) -> bool {
        self == PointClass::Ground
    }
}

impl fmt::Display for PointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointClass::NeverClassified => write!(f, "never classified"),
            PointClass::NonGround => write!(f, "non-ground"),
            PointClass::Ground => write!(f, "ground"),
        }
    }
}
