#[cfg(test)]
mod proptest_ramp {
    use crate::setpoint::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(5000))]

        // Property: non-zero speeds encode to the rounded step delay
        #[test]
        fn encoding_matches_formula(rpm in 0.001f64..=1000.0) {
            let expected = (60.0 / (rpm * STEPS_PER_REVOLUTION) * 1_000_000.0).round() as u64;
            prop_assert_eq!(encode_step_delay_us(rpm), expected);

            let validated = Setpoint::new(rpm).validate(&RampLimits::default());
            prop_assert_eq!(validated.map(|s| s.encode()), Ok(expected));
        }

        // Property: slower speeds never encode to shorter delays
        #[test]
        fn encoding_is_monotone(a in 0.01f64..=1000.0, b in 0.01f64..=1000.0) {
            let (slow, fast) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(encode_step_delay_us(slow) >= encode_step_delay_us(fast));
        }

        #[test]
        fn overspeed_always_rejected(rpm in 1000.001f64..1.0e6) {
            let result = Setpoint::new(rpm).validate(&RampLimits::default());
            let is_overspeed = matches!(result, Err(SetpointViolation::ExceedsMaxRpm { .. }));
            prop_assert!(is_overspeed, "Expected ExceedsMaxRpm, got {:?}", result);
        }

        #[test]
        fn negative_always_rejected(rpm in -1.0e6f64..-0.0001) {
            let result = Setpoint::new(rpm).validate(&RampLimits::default());
            let is_negative = matches!(result, Err(SetpointViolation::Negative { .. }));
            prop_assert!(is_negative, "Expected Negative, got {:?}", result);
        }
    }

    #[test]
    fn zero_is_the_stop_code() {
        assert_eq!(encode_step_delay_us(0.0), STOP_CODE);
        assert_eq!(Setpoint::<Validated>::stop().encode(), STOP_CODE);
    }
}
