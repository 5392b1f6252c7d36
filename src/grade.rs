use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GradeLabel {
    A1,
    A2,
    A3,
    A4,
    A5,
    B1,
    B2,
    B3,
    C1,
    C2,
    C3,
    D1,
    D2,
    D3,
    E1,
    E2,
    E3,
    F1,
    F2,
    F3,
    G1,
    G2,
    H,
}

/// Best to worst. Point values run 22 down to 0.
const SCALE: [(GradeLabel, &str, i64); 23] = [
    (GradeLabel::A1, "A1", 22),
    (GradeLabel::A2, "A2", 21),
    (GradeLabel::A3, "A3", 20),
    (GradeLabel::A4, "A4", 19),
    (GradeLabel::A5, "A5", 18),
    (GradeLabel::B1, "B1", 17),
    (GradeLabel::B2, "B2", 16),
    (GradeLabel::B3, "B3", 15),
    (GradeLabel::C1, "C1", 14),
    (GradeLabel::C2, "C2", 13),
    (GradeLabel::C3, "C3", 12),
    (GradeLabel::D1, "D1", 11),
    (GradeLabel::D2, "D2", 10),
    (GradeLabel::D3, "D3", 9),
    (GradeLabel::E1, "E1", 8),
    (GradeLabel::E2, "E2", 7),
    (GradeLabel::E3, "E3", 6),
    (GradeLabel::F1, "F1", 5),
    (GradeLabel::F2, "F2", 4),
    (GradeLabel::F3, "F3", 3),
    (GradeLabel::G1, "G1", 2),
    (GradeLabel::G2, "G2", 1),
    (GradeLabel::H, "H", 0),
];

pub const TOP_GRADE: GradeLabel = GradeLabel::A1;
pub const BOTTOM_GRADE: GradeLabel = GradeLabel::H;

/// Returned by `to_int` for labels outside the scale.
pub const UNKNOWN_POINTS: i64 = -1;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GradeError {
    #[error("invalid mark format: {0} is not an integer")]
    InvalidMarkFormat(f64),
    #[error("invalid grade: {0:?}")]
    InvalidGrade(String),
}

impl GradeError {
    pub fn code(&self) -> &'static str {
        match self {
            GradeError::InvalidMarkFormat(_) => "invalid_mark_format",
            GradeError::InvalidGrade(_) => "invalid_grade",
        }
    }
}

struct GradeScale {
    by_label: HashMap<&'static str, GradeLabel>,
    by_points: HashMap<i64, GradeLabel>,
}

fn scale() -> &'static GradeScale {
    static SCALE_MAPS: OnceLock<GradeScale> = OnceLock::new();
    SCALE_MAPS.get_or_init(|| GradeScale {
        by_label: SCALE.iter().map(|(g, s, _)| (*s, *g)).collect(),
        by_points: SCALE.iter().map(|(g, _, p)| (*p, *g)).collect(),
    })
}

impl GradeLabel {
    pub fn all() -> impl Iterator<Item = GradeLabel> {
        SCALE.iter().map(|(g, _, _)| *g)
    }

    pub fn as_str(self) -> &'static str {
        SCALE[self as usize].1
    }

    pub fn points(self) -> i64 {
        SCALE[self as usize].2
    }

    pub fn from_points(points: i64) -> Option<GradeLabel> {
        scale().by_points.get(&points).copied()
    }

    pub fn parse(label: &str) -> Option<GradeLabel> {
        scale().by_label.get(label).copied()
    }

    pub fn band(self) -> char {
        self.as_str().chars().next().unwrap_or('H')
    }

    pub fn is_boundary(self) -> bool {
        self == TOP_GRADE || self == BOTTOM_GRADE
    }
}

impl fmt::Display for GradeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of converting a mark to a letter. An integer mark with no label on
/// the scale is not an error: it comes back as a descriptive placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Letter {
    Grade(GradeLabel),
    Unknown(String),
}

impl Letter {
    pub fn grade(&self) -> Option<GradeLabel> {
        match self {
            Letter::Grade(g) => Some(*g),
            Letter::Unknown(_) => None,
        }
    }
}

impl fmt::Display for Letter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Letter::Grade(g) => write!(f, "{}", g),
            Letter::Unknown(s) => f.write_str(s),
        }
    }
}

/// Round half away from zero. Shared by rubric aggregation and grade averaging.
pub fn round_half_up(x: f64) -> i64 {
    x.round() as i64
}

pub fn to_letter(mark: f64) -> Result<Letter, GradeError> {
    if !mark.is_finite() || mark.fract() != 0.0 {
        return Err(GradeError::InvalidMarkFormat(mark));
    }
    // `as` saturates, so the sentinel reports the mark as given.
    match GradeLabel::from_points(mark as i64) {
        Some(g) => Ok(Letter::Grade(g)),
        None => {
            tracing::error!(mark, "mark has no grade label");
            Ok(Letter::Unknown(format!("Invalid mark: {}", mark)))
        }
    }
}

pub fn to_int(label: &str) -> i64 {
    match GradeLabel::parse(label) {
        Some(g) => g.points(),
        None => {
            tracing::error!(label, "unknown grade label");
            UNKNOWN_POINTS
        }
    }
}

pub fn get_band(label: &str) -> Result<char, GradeError> {
    GradeLabel::parse(label)
        .map(GradeLabel::band)
        .ok_or_else(|| GradeError::InvalidGrade(label.to_string()))
}

pub fn same_band(a: &str, b: &str) -> Result<bool, GradeError> {
    Ok(get_band(a)? == get_band(b)?)
}

pub fn is_boundary(label: &str) -> bool {
    GradeLabel::parse(label)
        .map(GradeLabel::is_boundary)
        .unwrap_or(false)
}

pub fn average(a: GradeLabel, b: GradeLabel) -> GradeLabel {
    let mean = (a.points() + b.points()) as f64 / 2.0;
    // The mean of two scale points is always on the scale.
    GradeLabel::from_points(round_half_up(mean)).unwrap_or(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_is_a_bijection() {
        let labels: Vec<GradeLabel> = GradeLabel::all().collect();
        assert_eq!(labels.len(), 23);
        for (i, g) in labels.iter().enumerate() {
            assert_eq!(g.points(), 22 - i as i64);
            assert_eq!(GradeLabel::parse(g.as_str()), Some(*g));
        }
    }

    #[test]
    fn mark_and_label_round_trip() {
        for m in 0..=22 {
            let letter = to_letter(m as f64).expect("integer mark");
            assert_eq!(to_int(&letter.to_string()), m);
        }
        for g in GradeLabel::all() {
            let back = to_letter(to_int(g.as_str()) as f64).expect("integer mark");
            assert_eq!(back, Letter::Grade(g));
        }
    }

    #[test]
    fn fractional_mark_is_a_hard_error() {
        assert_eq!(to_letter(3.5), Err(GradeError::InvalidMarkFormat(3.5)));
        assert!(to_letter(f64::NAN).is_err());
    }

    #[test]
    fn out_of_scale_lookups_return_sentinels() {
        assert_eq!(
            to_letter(23.0),
            Ok(Letter::Unknown("Invalid mark: 23".to_string()))
        );
        assert_eq!(to_letter(-1.0).map(|l| l.grade()), Ok(None));
        assert_eq!(
            to_letter(1e20),
            Ok(Letter::Unknown("Invalid mark: 100000000000000000000".to_string()))
        );
        assert_eq!(to_int("Z9"), UNKNOWN_POINTS);
        assert_eq!(to_int("a1"), UNKNOWN_POINTS);
    }

    #[test]
    fn band_lookup_rejects_unknown_labels() {
        assert_eq!(get_band("C2"), Ok('C'));
        assert_eq!(get_band("H"), Ok('H'));
        assert_eq!(get_band("X"), Err(GradeError::InvalidGrade("X".into())));
        assert_eq!(same_band("B1", "B3"), Ok(true));
        assert_eq!(same_band("B3", "C1"), Ok(false));
        assert!(same_band("B1", "nope").is_err());
    }

    #[test]
    fn only_a1_and_h_are_boundaries() {
        let boundaries: Vec<GradeLabel> =
            GradeLabel::all().filter(|g| g.is_boundary()).collect();
        assert_eq!(boundaries, vec![GradeLabel::A1, GradeLabel::H]);
        assert!(!is_boundary("E1"));
        assert!(!is_boundary("unknown"));
    }

    #[test]
    fn average_rounds_half_up() {
        assert_eq!(average(GradeLabel::B3, GradeLabel::C2), GradeLabel::C1);
        // 17 and 14 -> 15.5 -> 16
        assert_eq!(average(GradeLabel::B1, GradeLabel::C1), GradeLabel::B2);
        assert_eq!(average(GradeLabel::H, GradeLabel::G2), GradeLabel::G2);
        assert_eq!(round_half_up(2.5), 3);
        assert_eq!(round_half_up(2.49), 2);
        assert_eq!(round_half_up(-2.5), -3);
    }
}
