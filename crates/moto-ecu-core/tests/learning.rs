//! Tests for the adaptive learning rule and staged refinement

#[cfg(test)]
mod tests {
    use moto_ecu_core::fuel_map::{Cell, FuelMap, Profile, MAX_VALUE, MIN_VALUE};
    use moto_ecu_core::learning::{
        ConvergenceTracker, LearnOutcome, LearningEngine, LearningSettings, SkipReason, STAGES,
    };
    use moto_ecu_core::protocol::{DynoData, SensorSample};

    fn sample(rpm: f64, map: f64, afr: f64, engine_temp: f64) -> SensorSample {
        SensorSample {
            rpm,
            map,
            afr,
            engine_temp,
            dyno: None,
        }
    }

    #[test]
    fn test_lean_sample_raises_cell_by_kp_times_error() {
        let engine = LearningEngine::default();
        let mut map = FuelMap::seeded(1, 15);
        let cell = map.lookup(3000.0, 60.0);
        let before = map.get(cell).unwrap();

        let target = engine.settings().target_afr(Profile::Efficiency);
        let outcome = engine.update(&mut map, &sample(3000.0, 60.0, 13.5, 25.0), target, Profile::Efficiency);

        match outcome {
            LearnOutcome::Applied {
                cell: applied,
                previous,
                value,
                dyno_bonus,
            } => {
                assert_eq!(applied, cell);
                assert_eq!(previous, before);
                assert!((value - before - 0.012).abs() < 1e-9);
                assert!(!dyno_bonus);
            }
            other => panic!("expected an applied update, got {other:?}"),
        }
        assert!((map.get(cell).unwrap() - before - 0.012).abs() < 1e-9);
    }

    #[test]
    fn test_only_the_operating_cell_changes() {
        let engine = LearningEngine::default();
        let original = FuelMap::seeded(2, 15);
        let mut map = original.clone();

        engine.update(&mut map, &sample(4200.0, 75.0, 15.5, 80.0), 14.7, Profile::Efficiency);

        let touched = map.lookup(4200.0, 75.0);
        for i in 0..15 {
            for j in 0..15 {
                let cell = Cell { rpm: i, map: j };
                if cell != touched {
                    assert_eq!(map.get(cell), original.get(cell));
                }
            }
        }
        // rich mixture lowers the cell
        assert!(map.get(touched).unwrap() < original.get(touched).unwrap());
    }

    #[test]
    fn test_rpm_above_axis_is_skipped() {
        let engine = LearningEngine::default();
        let original = FuelMap::seeded(1, 15);
        let mut map = original.clone();

        let outcome = engine.update(&mut map, &sample(7000.0, 60.0, 13.5, 25.0), 14.7, Profile::Efficiency);

        assert_eq!(
            outcome,
            LearnOutcome::Skipped(SkipReason::OutOfRange {
                rpm: 7000.0,
                map: 60.0
            })
        );
        assert_eq!(map, original);
    }

    #[test]
    fn test_map_below_axis_is_skipped() {
        let engine = LearningEngine::default();
        let mut map = FuelMap::seeded(1, 15);
        let outcome = engine.update(&mut map, &sample(3000.0, 10.0, 13.5, 25.0), 14.7, Profile::Efficiency);
        assert!(!outcome.is_applied());
    }

    #[test]
    fn test_clamp_holds_for_any_error_magnitude() {
        let engines = [
            LearningEngine::default(),
            LearningEngine::new(LearningSettings {
                kp: 50.0,
                dyno_gain: 10.0,
                ..LearningSettings::default()
            }),
        ];
        let afrs = [0.0, 6.0, 9.5, 14.7, 18.0, 25.0, 1e6, -1e6];

        for engine in &engines {
            let mut map = FuelMap::seeded(4, 15);
            for _ in 0..50 {
                for &afr in &afrs {
                    let mut s = sample(3000.0, 60.0, afr, 80.0);
                    s.dyno = Some(DynoData {
                        hp: 1e4,
                        torque: 1e4,
                    });
                    engine.update(&mut map, &s, 12.5, Profile::Performance);
                    engine.update(&mut map, &sample(5000.0, 90.0, afr, 80.0), 14.7, Profile::Efficiency);
                }
            }
            assert!(map
                .values()
                .iter()
                .flatten()
                .all(|v| (MIN_VALUE..=MAX_VALUE).contains(v)));
        }
    }

    #[test]
    fn test_dyno_bonus_marks_map() {
        let engine = LearningEngine::default();
        let mut map = FuelMap::seeded(1, 15);
        let mut s = sample(3000.0, 60.0, 12.5, 80.0);
        s.dyno = Some(DynoData { hp: 10.0, torque: 10.0 });

        let outcome = engine.update(&mut map, &s, 12.5, Profile::Performance);
        assert!(matches!(outcome, LearnOutcome::Applied { dyno_bonus: true, .. }));
        assert!(map.dyno_learned());
    }

    #[test]
    fn test_stages_refine_coarse_to_fine() {
        let resolutions: Vec<usize> = STAGES.iter().map(|s| s.resolution).collect();
        assert_eq!(resolutions, vec![15, 20, 25]);
        assert!(STAGES.iter().all(|s| s.threshold > 0.0));
    }

    #[test]
    fn test_steady_learning_converges() {
        let engine = LearningEngine::default();
        let mut map = FuelMap::seeded(1, 15);
        let mut tracker = ConvergenceTracker::new();
        tracker.check(&map, STAGES[0].threshold);

        // AFR on target: updates are applied but nothing moves
        for _ in 0..10 {
            if engine
                .update(&mut map, &sample(3000.0, 60.0, 14.7, 80.0), 14.7, Profile::Efficiency)
                .is_applied()
            {
                tracker.record_update();
            }
        }
        assert!(tracker.check(&map, STAGES[0].threshold));

        // a large sustained error keeps the map moving
        for _ in 0..20 {
            engine.update(&mut map, &sample(3000.0, 60.0, 6.0, 80.0), 14.7, Profile::Efficiency);
            tracker.record_update();
        }
        assert!(!tracker.check(&map, STAGES[0].threshold));
    }
}
