//! Tests for fuel map lookup, re-binning and persistence

#[cfg(test)]
mod tests {
    use moto_ecu_core::fuel_map::{
        AxisRange, Cell, FuelMap, FuelMapStore, PersistenceError, Profile, MAX_VALUE, MIN_VALUE,
    };
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn test_lookup_always_in_bounds() {
        let map = FuelMap::seeded(1, 15);
        let rpms = [-500.0, 0.0, 999.0, 1000.0, 3250.5, 6499.9, 6500.0, 7000.0, f64::MAX];
        let maps = [-1.0, 0.0, 20.0, 59.99, 100.0, 250.0, f64::NAN];

        for &rpm in &rpms {
            for &kpa in &maps {
                let cell = map.lookup(rpm, kpa);
                assert!(cell.rpm < 15, "rpm index {} for {rpm}", cell.rpm);
                assert!(cell.map < 15, "map index {} for {kpa}", cell.map);
            }
        }
    }

    #[test]
    fn test_lookup_edges() {
        let map = FuelMap::seeded(1, 15);
        assert_eq!(map.lookup(1000.0, 20.0), Cell { rpm: 0, map: 0 });
        assert_eq!(map.lookup(6500.0, 100.0), Cell { rpm: 14, map: 14 });
    }

    #[test]
    fn test_seeded_maps_differ_per_cylinder() {
        let one = FuelMap::seeded(1, 15);
        let two = FuelMap::seeded(2, 15);
        let cell = Cell { rpm: 4, map: 9 };

        assert!((one.get(cell).unwrap() - (2.0 + 0.8 + 1.8)).abs() < 1e-9);
        assert!((two.get(cell).unwrap() - one.get(cell).unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(one.rpm_range(), AxisRange(1000.0, 6500.0));
        assert_eq!(one.map_range(), AxisRange(20.0, 100.0));
        assert!(!one.dyno_learned());
    }

    #[test]
    fn test_set_clamps_into_bounds() {
        let mut map = FuelMap::seeded(1, 15);
        let cell = Cell { rpm: 0, map: 0 };
        assert_eq!(map.set(cell, 1e9), Some(MAX_VALUE));
        assert_eq!(map.set(cell, -3.0), Some(MIN_VALUE));
        assert_eq!(map.set(Cell { rpm: 15, map: 0 }, 5.0), None);
    }

    #[test]
    fn test_rebin_preserves_flat_map() {
        let values = vec![vec![4.0; 15]; 15];
        let map = FuelMap::with_axes(AxisRange(1000.0, 6500.0), AxisRange(20.0, 100.0), values).unwrap();
        let fine = map.rebin(20);

        assert_eq!(fine.resolution(), 20);
        assert!(fine.values().iter().flatten().all(|v| (v - 4.0).abs() < 1e-12));
        assert_eq!(fine.rpm_range(), map.rpm_range());
    }

    #[test]
    fn test_rebin_keeps_ramp_monotonic() {
        let fine = FuelMap::seeded(1, 15).rebin(25);
        for row in fine.values() {
            for pair in row.windows(2) {
                assert!(pair[1] >= pair[0]);
            }
        }
    }

    #[test]
    fn test_with_axes_rejects_decreasing_range() {
        let values = vec![vec![2.0; 3]; 3];
        assert!(FuelMap::with_axes(AxisRange(6500.0, 1000.0), AxisRange(20.0, 100.0), values).is_none());
    }

    #[test]
    fn test_persist_reload_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = FuelMapStore::new(dir.path());

        let mut map = FuelMap::seeded(3, 20);
        // values with no short decimal representation
        for i in 0..20 {
            for j in 0..20 {
                let v = 1.0 + (i * 20 + j) as f64 / 7.0 + 0.1 / 3.0;
                map.set(Cell { rpm: i, map: j }, v);
            }
        }
        map.mark_dyno_learned();

        store.save(&map, Profile::Performance, 3).unwrap();
        let loaded = store.load(Profile::Performance, 3).unwrap();

        for (a, b) in map.values().iter().flatten().zip(loaded.values().iter().flatten()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_saved_file_carries_entity_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FuelMapStore::new(dir.path());
        store.save(&FuelMap::seeded(1, 15), Profile::Efficiency, 1).unwrap();

        let path = dir.path().join("fuel_map_efficiency_cylinder_1.json");
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();

        assert_eq!(json["resolution"], 15);
        assert_eq!(json["rpm_range"], serde_json::json!([1000.0, 6500.0]));
        assert_eq!(json["dyno_learned"], false);
        assert!(json["modified"].is_string());
        assert_eq!(json["values"].as_array().unwrap().len(), 15);
    }

    #[test]
    fn test_out_of_bounds_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FuelMapStore::new(dir.path());
        let path = store.path_for(Profile::Efficiency, 1);
        fs::write(
            &path,
            r#"{"resolution":2,"rpm_range":[1000,6500],"map_range":[20,100],"values":[[1,2],[3,99]],"dyno_learned":false}"#,
        )
        .unwrap();

        assert!(matches!(
            store.load(Profile::Efficiency, 1),
            Err(PersistenceError::Json { .. })
        ));
    }

    #[test]
    fn test_unreadable_file_falls_back_to_seed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FuelMapStore::new(dir.path());
        fs::write(store.path_for(Profile::Efficiency, 2), "{ not json").unwrap();

        let map = store.load_or_create(Profile::Efficiency, 2, 15);
        assert_eq!(map, FuelMap::seeded(2, 15));
    }

    #[test]
    fn test_profiles_persist_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = FuelMapStore::new(dir.path());

        let mut performance = FuelMap::seeded(1, 15);
        performance.set(Cell { rpm: 5, map: 5 }, 12.0);
        store.save(&FuelMap::seeded(1, 15), Profile::Efficiency, 1).unwrap();
        store.save(&performance, Profile::Performance, 1).unwrap();

        assert_eq!(store.load(Profile::Efficiency, 1).unwrap(), FuelMap::seeded(1, 15));
        assert_eq!(store.load(Profile::Performance, 1).unwrap(), performance);
    }
}
