//! Property-based test generators using proptest.
//!
//! Provides strategies for generating names, subscripts and values the
//! engine accepts.

use proptest::prelude::*;
use treeline_engine::numeric;
use treeline_engine::{MAX_SUBSCRIPTS, MAX_VARNAME_LEN};

/// Strategy for generating valid local variable names.
pub fn local_name_strategy() -> impl Strategy<Value = String> {
    let pattern = format!("[a-zA-Z%][a-zA-Z0-9]{{0,{}}}", MAX_VARNAME_LEN - 1);
    prop::string::string_regex(&pattern).expect("Invalid regex")
}

/// Strategy for generating valid global variable names.
pub fn global_name_strategy() -> impl Strategy<Value = String> {
    local_name_strategy().prop_map(|name| format!("^{name}"))
}

/// Strategy for generating valid variable names, local or global.
pub fn varname_strategy() -> impl Strategy<Value = String> {
    prop_oneof![local_name_strategy(), global_name_strategy()]
}

/// Strategy for generating numbers in canonical form (`12`, `-3`, `.5`).
pub fn canonical_number_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        any::<i32>().prop_map(|n| n.to_string()),
        (-10_000i32..10_000, 1u32..4).prop_map(|(n, places)| {
            let scale = 10f64.powi(places as i32);
            numeric::canonical(f64::from(n) / scale)
        }),
    ]
}

/// Strategy for generating subscripts: canonical numbers, text or raw bytes.
pub fn subscript_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        canonical_number_strategy().prop_map(String::into_bytes),
        prop::string::string_regex("[a-zA-Z][a-zA-Z0-9 _-]{0,15}")
            .expect("Invalid regex")
            .prop_map(String::into_bytes),
        prop::collection::vec(any::<u8>(), 1..24),
    ]
}

/// Strategy for generating subscript paths of up to `max_depth` elements.
pub fn path_strategy(max_depth: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(subscript_strategy(), 0..=max_depth.min(MAX_SUBSCRIPTS))
}

/// Strategy for generating values (arbitrary bytes).
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

/// Strategy for generating sets of distinct sibling subscripts.
pub fn sibling_set_strategy(max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::btree_set(subscript_strategy(), 1..=max_len).prop_map(|set| set.into_iter().collect())
}
