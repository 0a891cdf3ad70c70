use std::marker::PhantomData;

/// Mechanical resolution assumed by the motor firmware.
pub const STEPS_PER_REVOLUTION: f64 = 200.0;

/// Encoded value the motor firmware treats as "stop".
pub const STOP_CODE: u64 = 0;

#[derive(Debug, Clone, Copy)]
pub struct Unvalidated;

#[derive(Debug, Clone, Copy)]
pub struct Validated;

/// A commanded motor speed in RPM.
#[derive(Debug, Clone, Copy)]
pub struct Setpoint<State = Unvalidated> {
    rpm: f64,
    _state: PhantomData<State>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampLimits {
    pub max_rpm: f64,
}

impl Default for RampLimits {
    fn default() -> Self {
        Self { max_rpm: 1000.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum SetpointViolation {
    #[error("setpoint {requested} is not a finite number")]
    NonFinite { requested: f64 },

    #[error("setpoint {requested} rpm is negative")]
    Negative { requested: f64 },

    #[error("setpoint {requested} rpm exceeds the {limit} rpm limit")]
    ExceedsMaxRpm { requested: f64, limit: f64 },
}

impl Setpoint<Unvalidated> {
    pub fn new(rpm: f64) -> Self {
        Self {
            rpm,
            _state: PhantomData,
        }
    }

    pub fn validate(self, limits: &RampLimits) -> Result<Setpoint<Validated>, SetpointViolation> {
        if !self.rpm.is_finite() {
            return Err(SetpointViolation::NonFinite {
                requested: self.rpm,
            });
        }
        if self.rpm < 0.0 {
            return Err(SetpointViolation::Negative {
                requested: self.rpm,
            });
        }
        if self.rpm > limits.max_rpm {
            return Err(SetpointViolation::ExceedsMaxRpm {
                requested: self.rpm,
                limit: limits.max_rpm,
            });
        }

        Ok(Setpoint {
            rpm: self.rpm,
            _state: PhantomData,
        })
    }
}

impl Setpoint<Validated> {
    /// The stop command; always valid.
    pub fn stop() -> Self {
        Setpoint {
            rpm: 0.0,
            _state: PhantomData,
        }
    }

    pub fn rpm(&self) -> f64 {
        self.rpm
    }

    /// Microseconds between motor steps, as the firmware expects it.
    pub fn encode(&self) -> u64 {
        encode_step_delay_us(self.rpm)
    }
}

/// `0` for a stopped motor, otherwise `round(60 / (rpm * 200) * 1e6)`.
///
/// Zero is a reserved code rather than a limit of the formula, so it is matched
/// before any division happens.
pub fn encode_step_delay_us(rpm: f64) -> u64 {
    if rpm == 0.0 {
        return STOP_CODE;
    }
    (60.0 / (rpm * STEPS_PER_REVOLUTION) * 1_000_000.0).round() as u64
}

/// Inverse of [`encode_step_delay_us`], used by the simulated motor.
pub fn decode_step_delay_us(encoded: u64) -> f64 {
    if encoded == STOP_CODE {
        return 0.0;
    }
    60.0 / (encoded as f64 / 1_000_000.0) / STEPS_PER_REVOLUTION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_speeds() {
        assert_eq!(encode_step_delay_us(10.0), 30_000);
        assert_eq!(encode_step_delay_us(100.0), 3_000);
        assert_eq!(encode_step_delay_us(7.0), 42_857);
        assert_eq!(encode_step_delay_us(1000.0), 300);
    }

    #[test]
    fn zero_is_the_stop_code() {
        assert_eq!(encode_step_delay_us(0.0), STOP_CODE);
        assert_eq!(encode_step_delay_us(-0.0), STOP_CODE);
        assert_eq!(Setpoint::stop().encode(), STOP_CODE);
    }

    #[test]
    fn rounds_to_nearest_microsecond() {
        // 60 / (3 * 200) * 1e6 = 100_000 exactly; 60 / (11 * 200) * 1e6 = 27_272.72..
        assert_eq!(encode_step_delay_us(3.0), 100_000);
        assert_eq!(encode_step_delay_us(11.0), 27_273);
    }

    #[test]
    fn decode_inverts_encode_for_round_values() {
        assert!((decode_step_delay_us(3_000) - 100.0).abs() < 1e-9);
        assert_eq!(decode_step_delay_us(STOP_CODE), 0.0);
    }

    #[test]
    fn rejects_nan_setpoint() {
        let res = Setpoint::new(f64::NAN).validate(&RampLimits::default());
        assert!(matches!(res, Err(SetpointViolation::NonFinite { .. })));
    }

    #[test]
    fn rejects_negative_setpoint() {
        let res = Setpoint::new(-5.0).validate(&RampLimits::default());
        assert!(matches!(res, Err(SetpointViolation::Negative { .. })));
    }

    #[test]
    fn rejects_overspeed() {
        let res = Setpoint::new(1500.0).validate(&RampLimits::default());
        assert!(matches!(
            res,
            Err(SetpointViolation::ExceedsMaxRpm { limit, .. }) if limit == 1000.0
        ));
    }

    #[test]
    fn accepts_valid_setpoint() {
        let sp = Setpoint::new(250.0)
            .validate(&RampLimits::default())
            .unwrap();
        assert_eq!(sp.rpm(), 250.0);
        assert_eq!(sp.encode(), 1_200);
    }
}
