use std::ops::Sub;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EstimatorError {
    #[error(
        "infeasible motion: cannot reach distance {distance} from v0={v0} to v1={v1} under a={accel}"
    )]
    InfeasibleMotion {
        distance: f64,
        v0: f64,
        v1: f64,
        accel: f64,
    },
}

/// Axis limits mirroring the controller's own settings ($110/$111 max
/// rate, $120/$121 max acceleration, $11 junction deviation).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct KinematicLimits {
    pub max_rate_x: f64,
    pub max_rate_y: f64,
    pub max_accel_x: f64,
    pub max_accel_y: f64,
    pub junction_deviation: f64,
}

impl Default for KinematicLimits {
    fn default() -> Self {
        Self {
            max_rate_x: 3000.0,
            max_rate_y: 3000.0,
            max_accel_x: 800.0,
            max_accel_y: 800.0,
            junction_deviation: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    fn normalize(&self) -> Self {
        let length = self.length();
        if length == 0.0 {
            Self::default()
        } else {
            Self::new(self.x / length, self.y / length)
        }
    }

    fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y
    }

    fn abs(&self) -> Self {
        Self::new(self.x.abs(), self.y.abs())
    }
}

impl Sub for Point2 {
    type Output = Point2;

    fn sub(self, rhs: Point2) -> Point2 {
        Point2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Bounding box of every explicit target coordinate visited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }
}

impl Bounds {
    fn update(&mut self, point: Point2) {
        self.min_x = self.min_x.min(point.x);
        self.max_x = self.max_x.max(point.x);
        self.min_y = self.min_y.min(point.y);
        self.max_y = self.max_y.max(point.y);
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Machine position, scalar velocity along the last motion direction (mm/min),
/// and the last programmed feed rate (mm/min).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct MachineState {
    position: Point2,
    velocity_mm_per_min: f64,
    feed_mm_per_min: f64,
}

fn is_rapid_motion(line: &str) -> bool {
    line.starts_with("G0 ") || line.starts_with("G00 ")
}

fn is_motion(line: &str) -> bool {
    is_rapid_motion(line) || line.starts_with("G1 ") || line.starts_with("G01 ")
}

fn is_dwell(line: &str) -> bool {
    line.starts_with("G4")
}

fn is_comment_or_blank(line: &str) -> bool {
    line.is_empty() || line.starts_with(';') || line.starts_with('(')
}

struct LineParser {
    number: Regex,
}

impl LineParser {
    fn new() -> Self {
        Self {
            number: Regex::new(r"[-+]?[0-9]*\.?[0-9]+").unwrap(),
        }
    }

    fn word(&self, line: &str, letter: char) -> Option<f64> {
        let mut chars = line.char_indices().peekable();
        while let Some((idx, ch)) = chars.next() {
            if ch == letter {
                let rest = &line[idx + ch.len_utf8()..];
                if let Some(m) = self.number.find(rest) {
                    if m.start() == 0 {
                        return m.as_str().parse().ok();
                    }
                }
            }
        }
        None
    }

    /// Parses the X/Y/F words of a motion line, carrying forward any axis or
    /// feed not mentioned.
    fn parse_motion(&self, line: &str, position: Point2, feed: f64) -> (Point2, f64) {
        let x = self.word(line, 'X').unwrap_or(position.x);
        let y = self.word(line, 'Y').unwrap_or(position.y);
        let f = self.word(line, 'F').unwrap_or(feed);
        (Point2::new(x, y), f)
    }

    /// Dwell time in seconds: `P<seconds>` (GRBL 1.1+ dialect, configurable
    /// via `dwell_p_is_milliseconds`) or `S<seconds>`.
    fn parse_dwell(&self, line: &str, dwell_p_is_milliseconds: bool) -> f64 {
        if let Some(p) = self.word(line, 'P') {
            return if dwell_p_is_milliseconds { p / 1000.0 } else { p };
        }
        if let Some(s) = self.word(line, 'S') {
            return s;
        }
        0.0
    }
}

/// Selects the `G4 P` unit, per the spec's open question about GRBL dialect.
/// Defaults to seconds, matching GRBL 1.1+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DwellUnit {
    #[default]
    Seconds,
    Milliseconds,
}

fn max_rate_along(limits: &KinematicLimits, motion: Point2) -> f64 {
    let dir = motion.normalize().abs();
    let scale = dir.x.max(dir.y);
    if scale == 0.0 {
        return 0.0;
    }
    Point2::new(
        limits.max_rate_x * dir.x / scale,
        limits.max_rate_y * dir.y / scale,
    )
    .length()
}

fn max_accel_along(limits: &KinematicLimits, motion: Point2) -> f64 {
    let dir = motion.normalize().abs();
    let scale = dir.x.max(dir.y);
    if scale == 0.0 {
        return 0.0;
    }
    Point2::new(
        limits.max_accel_x * dir.x / scale,
        limits.max_accel_y * dir.y / scale,
    )
    .length()
}

/// Junction velocity (mm/s) at the boundary between `motion` and
/// `next_motion`. Zero if either segment has no length.
fn junction_velocity(limits: &KinematicLimits, motion: Point2, next_motion: Point2) -> f64 {
    if motion.length() == 0.0 || next_motion.length() == 0.0 {
        return 0.0;
    }

    let dir = motion.normalize();
    let next_dir = next_motion.normalize();
    let theta = dir.dot(&next_dir).clamp(-1.0, 1.0).acos();

    let sin_half = (theta / 2.0).sin();
    if sin_half == 0.0 {
        return f64::INFINITY;
    }

    let radius = limits.junction_deviation / sin_half;
    let max_centripetal_accel = limits.max_accel_x.min(limits.max_accel_y);
    (max_centripetal_accel * radius).sqrt()
}

/// Minimum time (seconds) to travel `distance` mm from `v0` to `v1` mm/s
/// under acceleration `accel` mm/s^2, never exceeding `v_cap` mm/s. Returns
/// the achievable end velocity alongside the time, since short segments may
/// not be able to reach the requested `v1`.
fn trapezoidal_time(
    distance: f64,
    v0: f64,
    v1: f64,
    v_cap: f64,
    accel: f64,
) -> Result<(f64, f64), EstimatorError> {
    let d_acc = (v_cap * v_cap - v0 * v0) / (2.0 * accel);
    let d_dec = (v_cap * v_cap - v1 * v1) / (2.0 * accel);

    if d_acc + d_dec <= distance {
        let accel_time = (v_cap - v0) / accel;
        let decel_time = (v_cap - v1) / accel;
        let cruise_distance = distance - (d_acc + d_dec);
        let cruise_time = cruise_distance / v_cap;
        return Ok((accel_time + cruise_time + decel_time, v1));
    }

    let peak_squared = (v0 * v0 + v1 * v1) / 2.0 + accel * distance;
    let peak = if peak_squared < 0.0 {
        0.0
    } else {
        peak_squared.sqrt()
    }
    .min(v_cap);

    let d_acc = (peak * peak - v0 * v0) / (2.0 * accel);
    let d_dec = (peak * peak - v1 * v1) / (2.0 * accel);

    if (d_acc + d_dec - distance).abs() < 1e-6 {
        let accel_time = (peak - v0) / accel;
        let decel_time = (peak - v1) / accel;
        return Ok((accel_time + decel_time, v1));
    }

    if d_acc + d_dec > distance && v0 > v1 {
        let achievable_squared = v0 * v0 - 2.0 * accel * distance;
        let achievable = if achievable_squared < 0.0 {
            0.0
        } else {
            achievable_squared.sqrt()
        };
        let time = (v0 - achievable) / accel;
        return Ok((time, achievable));
    }

    if d_acc + d_dec > distance && v0 < v1 {
        let achievable_squared = v0 * v0 + 2.0 * accel * distance;
        let achievable = if achievable_squared < 0.0 {
            0.0
        } else {
            achievable_squared.sqrt()
        };
        let time = (achievable - v0) / accel;
        return Ok((time, achievable));
    }

    Err(EstimatorError::InfeasibleMotion {
        distance,
        v0,
        v1,
        accel,
    })
}

fn mm_per_min_to_mm_per_sec(v: f64) -> f64 {
    v / 60.0
}

fn mm_per_sec_to_mm_per_min(v: f64) -> f64 {
    v * 60.0
}

/// Symbolically executes `gcode` against `limits`, returning total travel
/// time in seconds and the bounding box of every explicit target
/// coordinate. Pure: no I/O, deterministic for a given input.
pub fn estimate(
    gcode: &str,
    limits: &KinematicLimits,
    dwell_unit: DwellUnit,
) -> Result<(f64, Bounds), EstimatorError> {
    let parser = LineParser::new();
    let lines: Vec<String> = gcode.lines().map(|l| l.trim().to_uppercase()).collect();

    let mut state = MachineState::default();
    let mut bounds = Bounds::default();
    let mut total_time = 0.0;

    for i in 0..lines.len() {
        let line = &lines[i];

        if is_comment_or_blank(line) {
            continue;
        }

        if is_motion(line) {
            let (target, mut target_feed) =
                parser.parse_motion(line, state.position, state.feed_mm_per_min);

            let next_motion = lines[i + 1..]
                .iter()
                .find(|candidate| !is_comment_or_blank(candidate))
                .filter(|candidate| is_motion(candidate))
                .map(|candidate| {
                    let (next_target, _) = parser.parse_motion(candidate, target, target_feed);
                    next_target - target
                })
                .unwrap_or_default();

            bounds.update(target);

            let motion = target - state.position;
            let max_feed_along = max_rate_along(limits, motion);
            let max_accel_along = max_accel_along(limits, motion);

            if is_rapid_motion(line) || target_feed <= 0.0 {
                target_feed = max_feed_along;
            } else {
                target_feed = target_feed.min(max_feed_along);
            }

            let junction_vmax_mm_s = junction_velocity(limits, motion, next_motion);
            let junction_vmax = mm_per_sec_to_mm_per_min(junction_vmax_mm_s);
            let end_velocity = target_feed.min(junction_vmax);

            let distance = motion.length();

            let (dt, real_end_velocity) = if distance == 0.0 {
                (0.0, 0.0)
            } else {
                let (dt_s, v_end_s) = trapezoidal_time(
                    distance,
                    mm_per_min_to_mm_per_sec(state.velocity_mm_per_min),
                    mm_per_min_to_mm_per_sec(end_velocity),
                    mm_per_min_to_mm_per_sec(target_feed),
                    max_accel_along,
                )?;
                (dt_s, mm_per_sec_to_mm_per_min(v_end_s))
            };

            state.position = target;
            state.velocity_mm_per_min = real_end_velocity;
            state.feed_mm_per_min = target_feed;
            total_time += dt;
        } else if is_dwell(line) {
            total_time += parser.parse_dwell(line, dwell_unit == DwellUnit::Milliseconds);
        }
        // M3 and anything else: zero estimator time.
    }

    Ok((total_time, bounds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> KinematicLimits {
        KinematicLimits {
            max_rate_x: 3000.0,
            max_rate_y: 3000.0,
            max_accel_x: 800.0,
            max_accel_y: 800.0,
            junction_deviation: 0.01,
        }
    }

    #[test]
    fn single_rapid_matches_worked_example() {
        let (time, bounds) = estimate("G0 X100 Y0", &limits(), DwellUnit::Seconds).unwrap();
        assert!((time - 2.0625).abs() < 1e-3, "time was {}", time);
        assert_eq!(bounds.min_x, 0.0);
        assert_eq!(bounds.max_x, 100.0);
        assert_eq!(bounds.min_y, 0.0);
        assert_eq!(bounds.max_y, 0.0);
        assert_eq!(bounds.width(), 100.0);
        assert_eq!(bounds.height(), 0.0);
    }

    #[test]
    fn reversal_forces_a_near_stop_at_the_junction() {
        let gcode = "G1 X10 F1200\nG1 X0 F1200";
        let (time_reversal, _) = estimate(gcode, &limits(), DwellUnit::Seconds).unwrap();

        let (time_isolated, _) = estimate("G1 X10 F1200", &limits(), DwellUnit::Seconds).unwrap();

        // The junction velocity at a full reversal is small (driven by
        // junction_deviation) but not exactly zero, so this lands close to,
        // not exactly at, twice the isolated segment's time.
        assert!((time_reversal - 2.0 * time_isolated).abs() < 0.05 * time_isolated);
    }

    #[test]
    fn collinear_segments_do_not_stop_at_the_junction() {
        let two_segments = "G1 X10 F1200\nG1 X20 F1200";
        let (time_two, _) = estimate(two_segments, &limits(), DwellUnit::Seconds).unwrap();
        let (time_one, _) = estimate("G1 X10 F1200", &limits(), DwellUnit::Seconds).unwrap();

        assert!(time_two < 2.0 * time_one);
    }

    #[test]
    fn dwell_contributes_its_seconds_and_leaves_bounds_untouched() {
        let (time, bounds) = estimate("G4 P0.5", &limits(), DwellUnit::Seconds).unwrap();
        assert_eq!(time, 0.5);
        assert_eq!(bounds.min_x, f64::INFINITY);
    }

    #[test]
    fn dwell_p_can_be_interpreted_as_milliseconds() {
        let (time, _) = estimate("G4 P500", &limits(), DwellUnit::Milliseconds).unwrap();
        assert!((time - 0.5).abs() < 1e-9);
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let with_noise = "; hello\n\nG1 X1 Y1 F600\n( comment )";
        let bare = "G1 X1 Y1 F600";

        let (time_noisy, bounds_noisy) = estimate(with_noise, &limits(), DwellUnit::Seconds).unwrap();
        let (time_bare, bounds_bare) = estimate(bare, &limits(), DwellUnit::Seconds).unwrap();

        assert_eq!(time_noisy, time_bare);
        assert_eq!(bounds_noisy, bounds_bare);
    }

    #[test]
    fn m3_consumes_no_time() {
        let (time, _) = estimate("M3 S90", &limits(), DwellUnit::Seconds).unwrap();
        assert_eq!(time, 0.0);
    }

    #[test]
    fn estimate_is_deterministic() {
        let gcode = "G1 X10 Y5 F800\nG1 X20 Y5 F800\nG4 P0.2\nM3 S0";
        let a = estimate(gcode, &limits(), DwellUnit::Seconds).unwrap();
        let b = estimate(gcode, &limits(), DwellUnit::Seconds).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn trapezoidal_time_is_never_faster_than_cruise_or_than_pure_acceleration() {
        let (time, _) = trapezoidal_time(100.0, 0.0, 0.0, 50.0, 800.0).unwrap();
        assert!(time >= 100.0 / 50.0 - 1e-9);
    }

    #[test]
    fn short_segment_forms_a_triangle_instead_of_a_trapezoid() {
        // Too short to reach v_cap: accelerate to a peak below v_cap, then
        // decelerate straight back down to v1, skipping the cruise phase.
        let (time, v_end) = trapezoidal_time(2.0, 10.0, 0.0, 50.0, 800.0).unwrap();
        assert_eq!(v_end, 0.0);
        assert!(time > 0.0 && time < 0.5);
    }
}
