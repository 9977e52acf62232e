//! Property-based tests for the runtime's laws.
//!
//! Uses proptest to drive the public API with randomized inputs.

use nodal::config::{parse_node_set, parse_thread_cap};
use nodal::task::Priority;
use nodal::{MemSource, NodeList};
use proptest::prelude::*;

/// Strategy for small allocation sizes (arena path, below the mmap
/// threshold).
fn arena_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..32 * 1024, 1..64)
}

/// Strategy for well-formed node-set strings plus their expected value.
fn node_set_input() -> impl Strategy<Value = (String, Vec<i32>)> {
    prop::collection::vec(0i32..64, 1..8).prop_map(|ids| {
        let s = ids
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut expected = ids;
        expected.sort_unstable();
        (s, expected)
    })
}

proptest! {
    /// Every well-formed list round-trips to its sorted form.
    #[test]
    fn node_set_parses_sorted((s, expected) in node_set_input()) {
        prop_assert_eq!(parse_node_set(&s), Some(expected));
    }

    /// Ranges expand to the full closed interval.
    #[test]
    fn node_set_ranges_expand(lo in 0i32..32, len in 0i32..32) {
        let hi = lo + len;
        let s = format!("{}-{}", lo, hi);
        let parsed = parse_node_set(&s).unwrap();
        prop_assert_eq!(parsed.len() as i32, len + 1);
        prop_assert_eq!(parsed[0], lo);
        prop_assert_eq!(*parsed.last().unwrap(), hi);
    }

    /// Junk never parses.
    #[test]
    fn node_set_rejects_junk(s in "[a-z!@# ]{1,12}") {
        prop_assert_eq!(parse_node_set(&s), None);
    }

    /// Thread caps parse exactly the non-negative integers.
    #[test]
    fn thread_cap_roundtrip(n in 0usize..1_000_000) {
        prop_assert_eq!(parse_thread_cap(&n.to_string()), Some(n));
    }

    /// Priorities clamp into range and index densely.
    #[test]
    fn priority_clamp_and_index(v in i8::MIN..=i8::MAX) {
        let p = Priority::new(v);
        prop_assert!(p.value() >= -16 && p.value() <= 16);
        prop_assert_eq!(p.index(), (p.value() as isize + 16) as usize);
        // Clamping is idempotent.
        prop_assert_eq!(Priority::new(p.value()), p);
    }
}

proptest! {
    // Allocator laws run fewer cases: each exercises real mappings.
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// alloc/usable_size/node_of/free round-trip for arena-sized blocks.
    #[test]
    fn alloc_roundtrip(sizes in arena_sizes()) {
        let node = NodeList::logical()[0];
        let ms = MemSource::create(node, 1 << 22, "prop-roundtrip");
        prop_assume!(ms.valid());

        let mut ptrs = Vec::new();
        for &size in &sizes {
            let p = ms.alloc(size);
            prop_assert!(!p.is_null());
            prop_assert!(MemSource::usable_size(p) >= size);
            prop_assert_eq!(
                MemSource::node_of(p).physical_id(),
                ms.physical_node()
            );
            unsafe { p.write_bytes(0xAB, size) };
            ptrs.push(p);
        }
        for p in ptrs {
            MemSource::free(p);
        }
        // Everything returned: the arenas carry no payload bytes.
        prop_assert_eq!(ms.stats().arena_size, 0);
    }

    /// Aligned allocation honors every power-of-two alignment.
    #[test]
    fn aligned_alloc_is_aligned(shift in 4u32..13, size in 1usize..16 * 1024) {
        let align = 1usize << shift;
        let node = NodeList::logical()[0];
        let ms = MemSource::create(node, 1 << 22, "prop-aligned");
        prop_assume!(ms.valid());

        let p = ms.alloc_aligned(align, size);
        prop_assert!(!p.is_null());
        prop_assert_eq!(p as usize % align, 0);
        prop_assert!(MemSource::usable_size(p) >= size);
        unsafe { p.write_bytes(0xCD, size) };
        MemSource::free(p);
    }

    /// Free-then-realloc of the same size succeeds (no leak inside the
    /// arena, subject to capacity).
    #[test]
    fn free_makes_room(size in 1usize..64 * 1024) {
        let node = NodeList::logical()[0];
        let ms = MemSource::create(node, 1 << 21, "prop-reuse");
        prop_assume!(ms.valid());

        for _ in 0..16 {
            let p = ms.alloc(size);
            prop_assert!(!p.is_null());
            MemSource::free(p);
        }
    }
}
