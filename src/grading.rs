use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Smallest step between two percentages after rounding.
const PERCENT_STEP: f64 = 0.01;
const COVERAGE_EPSILON: f64 = 1e-9;

/// Round-half-up on the third decimal: `floor(100x + 0.5) / 100`.
pub fn round_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Percentage of `max_marks` obtained, rounded to two decimals.
///
/// A zero `max_marks` yields `0.0` instead of dividing. Negative and
/// over-100% inputs are passed through; callers validate marks.
pub fn calculate_percentage(marks_obtained: f64, max_marks: f64) -> f64 {
    if max_marks == 0.0 {
        return 0.0;
    }
    round_2_decimals(marks_obtained / max_marks * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub grade: String,
    pub grade_point: f64,
    #[serde(default)]
    pub description: String,
}

impl GradeBand {
    pub fn new(min: f64, max: f64, grade: &str, grade_point: f64, description: &str) -> Self {
        Self {
            min_percentage: min,
            max_percentage: max,
            grade: grade.to_string(),
            grade_point,
            description: description.to_string(),
        }
    }

    /// Returned by [`GradeResolver::calculate_grade`] when no band matches.
    pub fn not_available() -> Self {
        Self::new(0.0, 0.0, "N/A", 0.0, "Not Available")
    }

    pub fn contains(&self, percentage: f64) -> bool {
        self.min_percentage <= percentage && percentage <= self.max_percentage
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScaleError {
    #[error("grading scale must have at least one band")]
    Empty,
    #[error("band {index}: percentages must be finite numbers")]
    NonFinite { index: usize },
    #[error("band {index}: minPercentage {min} is greater than maxPercentage {max}")]
    InvertedRange { index: usize, min: f64, max: f64 },
    #[error("band {index}: grade must not be empty")]
    MissingGrade { index: usize },
    #[error("band {index}: gradePoint must be >= 0 (got {grade_point})")]
    NegativeGradePoint { index: usize, grade_point: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageKind {
    Gap,
    Overlap,
}

/// A stretch of `[0, 100]` that a scale leaves uncovered or covers twice.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageIssue {
    pub kind: CoverageKind,
    pub from: f64,
    pub to: f64,
}

/// Ordered percentage bands; resolution picks the first band that matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradingScale {
    bands: Vec<GradeBand>,
}

impl GradingScale {
    pub fn new(bands: Vec<GradeBand>) -> Self {
        Self { bands }
    }

    /// Standard 10-point university scale, highest band first.
    ///
    /// Upper bounds below 100 stop at `.99` so every two-decimal percentage
    /// in `[0, 100]` lands in exactly one band.
    pub fn ten_point() -> Self {
        Self::new(vec![
            GradeBand::new(90.0, 100.0, "O", 10.0, "Outstanding"),
            GradeBand::new(80.0, 89.99, "A+", 9.0, "Excellent"),
            GradeBand::new(70.0, 79.99, "A", 8.0, "Very Good"),
            GradeBand::new(60.0, 69.99, "B+", 7.0, "Good"),
            GradeBand::new(55.0, 59.99, "B", 6.0, "Above Average"),
            GradeBand::new(50.0, 54.99, "C", 5.0, "Average"),
            GradeBand::new(0.0, 49.99, "U", 0.0, "Re-Appear"),
        ])
    }

    pub fn bands(&self) -> &[GradeBand] {
        &self.bands
    }

    /// Structural checks applied before a custom scale is stored.
    /// Completeness over `[0, 100]` is not required; see [`Self::coverage_issues`].
    pub fn validate(&self) -> Result<(), ScaleError> {
        if self.bands.is_empty() {
            return Err(ScaleError::Empty);
        }
        for (index, band) in self.bands.iter().enumerate() {
            if !band.min_percentage.is_finite()
                || !band.max_percentage.is_finite()
                || !band.grade_point.is_finite()
            {
                return Err(ScaleError::NonFinite { index });
            }
            if band.min_percentage > band.max_percentage {
                return Err(ScaleError::InvertedRange {
                    index,
                    min: band.min_percentage,
                    max: band.max_percentage,
                });
            }
            if band.grade.trim().is_empty() {
                return Err(ScaleError::MissingGrade { index });
            }
            if band.grade_point < 0.0 {
                return Err(ScaleError::NegativeGradePoint {
                    index,
                    grade_point: band.grade_point,
                });
            }
        }
        Ok(())
    }

    /// Gaps and overlaps over `[0, 100]`, at two-decimal granularity.
    pub fn coverage_issues(&self) -> Vec<CoverageIssue> {
        let mut ranges: Vec<(f64, f64)> = self
            .bands
            .iter()
            .map(|b| (b.min_percentage, b.max_percentage))
            .collect();
        ranges.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        let mut issues = Vec::new();
        let mut covered_to: Option<f64> = None;
        for (min, max) in ranges {
            match covered_to {
                None => {
                    if min > 0.0 {
                        issues.push(CoverageIssue {
                            kind: CoverageKind::Gap,
                            from: 0.0,
                            to: min,
                        });
                    }
                }
                Some(prev) => {
                    if min <= prev {
                        issues.push(CoverageIssue {
                            kind: CoverageKind::Overlap,
                            from: min,
                            to: prev.min(max),
                        });
                    } else if min - prev > PERCENT_STEP + COVERAGE_EPSILON {
                        issues.push(CoverageIssue {
                            kind: CoverageKind::Gap,
                            from: prev,
                            to: min,
                        });
                    }
                }
            }
            covered_to = Some(covered_to.map_or(max, |p| p.max(max)));
        }

        match covered_to {
            None => issues.push(CoverageIssue {
                kind: CoverageKind::Gap,
                from: 0.0,
                to: 100.0,
            }),
            Some(end) if end < 100.0 => issues.push(CoverageIssue {
                kind: CoverageKind::Gap,
                from: end,
                to: 100.0,
            }),
            Some(_) => {}
        }
        issues
    }
}

impl Default for GradingScale {
    fn default() -> Self {
        Self::ten_point()
    }
}

/// Outcome of looking a percentage up in a scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a> {
    Band(&'a GradeBand),
    OutOfRange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseResult {
    pub course_code: String,
    #[serde(default)]
    pub course_name: String,
    pub credits: f64,
    pub marks_obtained: f64,
    pub max_marks: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatedResult {
    #[serde(flatten)]
    pub course: CourseResult,
    pub percentage: f64,
    pub grade: String,
    pub grade_point: f64,
    pub credit_points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CgpaResult {
    pub results: Vec<CalculatedResult>,
    pub total_credits: f64,
    pub total_credit_points: f64,
    pub cgpa: f64,
    pub percentage: f64,
    pub overall_grade: String,
}

/// Maps percentages to grades under one injected scale.
#[derive(Debug, Clone, Default)]
pub struct GradeResolver {
    scale: GradingScale,
}

impl GradeResolver {
    pub fn new(scale: GradingScale) -> Self {
        Self { scale }
    }

    pub fn resolve(&self, percentage: f64) -> Resolution<'_> {
        self.scale
            .bands
            .iter()
            .find(|b| b.contains(percentage))
            .map(Resolution::Band)
            .unwrap_or(Resolution::OutOfRange)
    }

    /// Like [`Self::resolve`] but total: out-of-range percentages get the
    /// `N/A` band with grade point 0.
    pub fn calculate_grade(&self, percentage: f64) -> GradeBand {
        match self.resolve(percentage) {
            Resolution::Band(band) => band.clone(),
            Resolution::OutOfRange => GradeBand::not_available(),
        }
    }

    pub fn is_passing(&self, percentage: f64) -> bool {
        self.calculate_grade(percentage).grade_point > 0.0
    }

    pub fn get_grade_point(&self, marks_obtained: f64, max_marks: f64) -> f64 {
        self.calculate_grade(calculate_percentage(marks_obtained, max_marks))
            .grade_point
    }

    pub fn calculate_cgpa(&self, course_results: &[CourseResult]) -> CgpaResult {
        let mut total_credits = 0.0_f64;
        let mut total_credit_points = 0.0_f64;
        let mut pooled_obtained = 0.0_f64;
        let mut pooled_max = 0.0_f64;

        let results: Vec<CalculatedResult> = course_results
            .iter()
            .map(|course| {
                let percentage = calculate_percentage(course.marks_obtained, course.max_marks);
                let band = self.calculate_grade(percentage);
                let credit_points = band.grade_point * course.credits;

                total_credits += course.credits;
                total_credit_points += credit_points;
                pooled_obtained += course.marks_obtained;
                pooled_max += course.max_marks;

                CalculatedResult {
                    course: course.clone(),
                    percentage,
                    grade: band.grade,
                    grade_point: band.grade_point,
                    credit_points,
                }
            })
            .collect();

        let cgpa = if total_credits > 0.0 {
            round_2_decimals(total_credit_points / total_credits)
        } else {
            0.0
        };

        // Pooled raw marks, not a credit-weighted mean of course percentages.
        let percentage = calculate_percentage(pooled_obtained, pooled_max);
        let overall_grade = self.calculate_grade(percentage).grade;

        CgpaResult {
            results,
            total_credits,
            total_credit_points,
            cgpa,
            percentage,
            overall_grade,
        }
    }
}
