use std::collections::HashSet;

use gdp_bench::coverage::ADDRESS_SPACE;
use gdp_bench::log_decoder::{decode, EntryKind, FpgaEvent, SpecField};
use gdp_bench::CoveragePlan;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn coverage_plan_is_distinct_and_sized(size in 1usize..=ADDRESS_SPACE, seed in any::<u64>()) {
        let plan = CoveragePlan::new(size, &mut StdRng::seed_from_u64(seed)).unwrap();
        prop_assert_eq!(plan.len(), size);
        let unique: HashSet<u16> = plan.addresses().iter().copied().collect();
        prop_assert_eq!(unique.len(), size, "duplicates for size={} seed={:#x}", size, seed);
    }

    #[test]
    fn decode_is_pure(index in any::<u16>(), spec in any::<u16>(), addr in any::<u16>()) {
        let first = decode(index, spec, addr);
        let second = decode(index, spec, addr);
        prop_assert_eq!(first, second);
        prop_assert_eq!(first.to_string(), second.to_string());
    }
}

#[test]
fn every_spec_value_decodes() {
    for spec in 0..=u16::MAX {
        let entry = decode(0, spec, 0);
        let text = entry.to_string();
        assert!(!text.is_empty());
        let reserved = SpecField(spec).is_reserved();
        match entry.kind {
            EntryKind::Event(event) => {
                assert!(reserved, "spec 0x{:04X} misclassified as event", spec);
                assert_eq!(entry.is_fatal(), spec == 0xF0);
                if spec != 0xF0 && spec != 0xF4 {
                    assert_eq!(event, FpgaEvent::Unknown);
                }
            }
            EntryKind::MemoryAccess(_) => {
                assert!(!reserved, "spec 0x{:04X} misclassified as access", spec);
                assert!(!entry.is_fatal());
            }
        }
    }
}
