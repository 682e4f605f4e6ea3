mod common;

use common::Device;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Integral values keep every partial sum exact in f64, so the persisted
    // state can be compared without tolerance.
    #[test]
    fn prop_average_is_weighted_mean(
        adds in proptest::collection::vec((-10_000i32..10_000, 0u64..3_600), 1..40),
    ) {
        let device = Device::new();
        let mut acc = device.boot().accumulator("/Trackers/test/accumulator.json");

        let mut sum = 0.0;
        let mut count = 0u64;
        for (value, weight) in adds {
            let value = f64::from(value);
            device.clock.advance(1);
            acc.add_weighted(value, weight).unwrap();
            sum += value * weight as f64;
            count += weight;
        }

        let expected = if count == 0 { 0.0 } else { sum / count as f64 };
        let state = device.boot().accumulator("/Trackers/test/accumulator.json").state();
        prop_assert_eq!(state.count, count);
        prop_assert_eq!(state.sum, sum);
        prop_assert_eq!(acc.average(), expected);

        acc.reset().unwrap();
        prop_assert_eq!(acc.count(), 0);
        prop_assert_eq!(acc.average(), 0.0);
    }
}
