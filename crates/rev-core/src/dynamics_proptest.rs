#[cfg(test)]
mod proptest_dynamics {
    use crate::clock::{ClockConfig, ClockEvent, SimulationClock};
    use crate::integrator::DynamicsIntegrator;
    use crate::params::{EngineParameters, ParameterSheet};
    use crate::state::{ControlInput, SimulationLimits};
    use crate::sync::StateExchange;
    use crate::synth::{AudioSynthesizer, SynthConfig};
    use crate::torque::{CurvePoint, CurveTorqueModel, TorqueModel};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    // Curves are built from positive RPM gaps so break points always increase.
    fn sheet_strategy() -> impl Strategy<Value = ParameterSheet> {
        (
            prop::collection::vec((50.0f64..1500.0, 0.0f64..600.0), 2..10),
            0.001f64..3.0,
            0.0001f64..2.0,
            300.0f64..1500.0,
            500.0f64..8000.0,
            1u32..=16,
            0.0f64..0.5,
        )
            .prop_map(
                |(gaps, inertia, friction, idle, span, cylinders, idle_throttle)| {
                    let mut rpm = 0.0;
                    let torque_curve = gaps
                        .into_iter()
                        .map(|(gap, torque)| {
                            rpm += gap;
                            CurvePoint::new(rpm, torque)
                        })
                        .collect();
                    ParameterSheet {
                        name: "generated".into(),
                        torque_curve,
                        inertia_kg_m2: inertia,
                        friction_nm_s_per_rad: friction,
                        idle_rpm: idle,
                        redline_rpm: idle + span,
                        cylinders,
                        idle_throttle,
                        harmonics: None,
                    }
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        // Property: RPM stays inside [0, redline * 1.05] for every tick
        #[test]
        fn rpm_stays_within_clamp(
            sheet in sheet_strategy(),
            controls in prop::collection::vec((-0.5f64..1.5, -100.0f64..5000.0), 1..50),
        ) {
            let params = Arc::new(EngineParameters::new(sheet).unwrap());
            let max_rpm = params.max_rpm();
            let integrator = DynamicsIntegrator::new(
                CurveTorqueModel,
                Arc::clone(&params),
                SimulationLimits::default(),
            );

            let mut state = integrator.initial_state();
            for (throttle, load) in controls {
                let control = ControlInput::new(throttle, load);
                for _ in 0..40 {
                    state = integrator.step(&state, control, 0.001).state;
                    prop_assert!(
                        state.rpm >= 0.0 && state.rpm <= max_rpm,
                        "rpm {} outside [0, {}] at tick {}", state.rpm, max_rpm, state.tick
                    );
                    prop_assert!(state.yield_w.is_finite());
                }
            }
        }

        // Property: out-of-range throttle behaves like the nearest bound
        #[test]
        fn throttle_is_clamped_not_rejected(
            sheet in sheet_strategy(),
            rpm_fraction in 0.0f64..1.2,
            excess in 0.0001f64..10.0,
        ) {
            let params = EngineParameters::new(sheet).unwrap();
            let rpm = params.redline_rpm() * rpm_fraction;
            let model = CurveTorqueModel;

            let over = model.torque(rpm, 1.0 + excess, 0.0, &params);
            let full = model.torque(rpm, 1.0, 0.0, &params);
            prop_assert_eq!(over, full);

            let under = model.torque(rpm, -excess, 0.0, &params);
            let closed = model.torque(rpm, 0.0, 0.0, &params);
            prop_assert_eq!(under, closed);
        }

        // Property: curve lookup never leaves the range of its break points
        #[test]
        fn lookup_stays_between_break_points(
            sheet in sheet_strategy(),
            rpm in 0.0f64..20000.0,
        ) {
            let params = EngineParameters::new(sheet).unwrap();
            let points = params.curve().points();
            let lo = points.iter().map(|p| p.torque_nm).fold(f64::INFINITY, f64::min);
            let hi = points.iter().map(|p| p.torque_nm).fold(f64::NEG_INFINITY, f64::max);
            let t = params.curve().lookup(rpm);
            prop_assert!(t >= lo - 1e-9 && t <= hi + 1e-9, "lookup {} outside [{}, {}]", t, lo, hi);
        }

        // Property: a pump never runs more than the bound, and without a
        // stall the leftover is always less than one tick
        #[test]
        fn pump_respects_step_bound(
            gaps_us in prop::collection::vec(0u64..300_000, 1..40),
        ) {
            let params = Arc::new(EngineParameters::new(ParameterSheet::inline_four()).unwrap());
            let config = ClockConfig::default();
            let bound = config.max_steps_per_iteration;
            let tick = config.tick_period;
            let integrator = DynamicsIntegrator::new(CurveTorqueModel, params, config.limits);
            let mut clock = SimulationClock::new(integrator, Arc::new(StateExchange::new()), config);

            let mut stalls = 0u64;
            let mut sink = |e: &ClockEvent| {
                if matches!(e, ClockEvent::StallRecovered(_)) {
                    stalls += 1;
                }
            };
            for gap in gaps_us {
                let report = clock.pump(Duration::from_micros(gap), &mut sink);
                prop_assert!(report.steps <= bound);
                if report.stall.is_some() {
                    prop_assert_eq!(report.steps, 0);
                    prop_assert_eq!(clock.accumulator(), Duration::ZERO);
                } else {
                    prop_assert!(clock.accumulator() < tick);
                }
            }
            prop_assert_eq!(clock.stats().stalls_recovered, stalls);
        }

        // Property: the synthesizer fills exactly the requested block with
        // finite samples for any published speed
        #[test]
        fn synth_fills_blocks_with_finite_samples(
            sheet in sheet_strategy(),
            rpms in prop::collection::vec(0.0f64..12000.0, 1..8),
            len in 0usize..2048,
        ) {
            let params = EngineParameters::new(sheet).unwrap();
            let exchange = Arc::new(StateExchange::new());
            let mut synth = AudioSynthesizer::new(Arc::clone(&exchange), &params, SynthConfig::default());
            let mut buf = vec![f32::NAN; len];

            for (tick, rpm) in rpms.into_iter().enumerate() {
                let mut state = crate::state::EngineState::at_rest(rpm);
                state.tick = tick as u64 + 1;
                exchange.publish_state(state);
                let frame = synth.render(&mut buf);
                prop_assert_eq!(frame.samples.len(), len);
                prop_assert!(frame.samples.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
            }
        }
    }
}
