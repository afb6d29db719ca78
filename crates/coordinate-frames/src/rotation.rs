//! Earth-orientation rotation chain.
//!
//! TEME carries the mean equinox, so the chain to the terrestrial frame is
//! the equation-of-the-equinoxes rotation into true-of-date, the apparent
//! sidereal rotation (from UT1) into the pseudo-Earth-fixed frame, and the
//! polar-motion wobble into ECEF.

use nalgebra::{Matrix3, Vector3};

use crate::nutation::equation_of_equinoxes;
use crate::time::{TimeScales, JD_J2000};

const TWO_PI: f64 = 2.0 * std::f64::consts::PI;
const ARCSEC_TO_RAD: f64 = std::f64::consts::PI / (180.0 * 3600.0);

/// Frame rotation about the z axis.
pub fn rot_z(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0)
}

/// Frame rotation about the x axis.
pub fn rot_x(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, s, 0.0, -s, c)
}

/// Frame rotation about the y axis.
pub fn rot_y(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(c, 0.0, -s, 0.0, 1.0, 0.0, s, 0.0, c)
}

/// Earth rotation angle from UT1, radians in [0, 2π).
pub fn era(jd_ut1: f64) -> f64 {
    let du = jd_ut1 - JD_J2000;
    let theta = TWO_PI * (0.779_057_273_264_0 + 1.002_737_811_911_354_48 * du);
    theta.rem_euclid(TWO_PI)
}

/// Greenwich mean sidereal time (IAU 2006 expression on top of the ERA).
pub fn gmst(scales: &TimeScales) -> f64 {
    let t = scales.t_tt();
    let correction_arcsec = 0.014_506
        + t * (4_612.156_534 + t * (1.391_581_7 + t * (-0.000_000_44 + t * -0.000_029_956)));
    (era(scales.jd_ut1) + correction_arcsec * ARCSEC_TO_RAD).rem_euclid(TWO_PI)
}

/// Greenwich apparent sidereal time: GMST plus the equation of equinoxes.
pub fn gast(scales: &TimeScales) -> f64 {
    (gmst(scales) + equation_of_equinoxes(scales.t_tt())).rem_euclid(TWO_PI)
}

/// Polar motion wobble, arcsec inputs.
pub fn polar_motion_matrix(xp_arcsec: f64, yp_arcsec: f64) -> Matrix3<f64> {
    let xp = xp_arcsec * ARCSEC_TO_RAD;
    let yp = yp_arcsec * ARCSEC_TO_RAD;
    rot_y(-xp) * rot_x(-yp)
}

/// TEME position (km) to ECEF (km).
pub fn teme_to_ecef(
    r_teme: Vector3<f64>,
    scales: &TimeScales,
    xp_arcsec: f64,
    yp_arcsec: f64,
) -> Vector3<f64> {
    let t = scales.t_tt();
    // Mean-equinox frame into true-of-date, then the apparent sidereal
    // rotation; the composition reduces to the mean sidereal rotation.
    let r_tod = rot_z(-equation_of_equinoxes(t)) * r_teme;
    let r_pef = rot_z(gast(scales)) * r_tod;
    polar_motion_matrix(xp_arcsec, yp_arcsec) * r_pef
}
