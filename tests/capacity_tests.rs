use metarestore::capacity::{CapacityPolicy, next_capacity};

#[metarestore::test]
fn next_capacity_grows_by_factor() {
    let policy = CapacityPolicy { growth_factor: 1.2 };
    // ceil(10 * 1.2) = 12
    assert_eq!(next_capacity(10, &policy), 12);
    // ceil(11 * 1.2) = ceil(13.2) = 14
    assert_eq!(next_capacity(11, &policy), 14);
}

#[metarestore::test]
fn next_capacity_always_grows_by_at_least_one() {
    let policy = CapacityPolicy::default();
    assert_eq!(next_capacity(0, &policy), 1);
    assert_eq!(next_capacity(1, &policy), 2);
    assert_eq!(next_capacity(2, &policy), 3);

    let flat = CapacityPolicy { growth_factor: 1.0 };
    assert_eq!(next_capacity(100, &flat), 101);
}

#[metarestore::test]
fn next_capacity_saturates() {
    let policy = CapacityPolicy { growth_factor: 2.0 };
    assert_eq!(next_capacity(u32::MAX - 1, &policy), u32::MAX);
    assert_eq!(next_capacity(u32::MAX, &policy), u32::MAX);
}

#[metarestore::test]
fn initial_capacity_spreads_groups_over_clusters() {
    // (40 / 2 + 20 - 1) / 4 = 39 / 4 = 9
    assert_eq!(CapacityPolicy::initial_capacity(40, 20, 4), 9);
    // (0 / 2 + 0 - 1) saturates to 0
    assert_eq!(CapacityPolicy::initial_capacity(0, 0, 3), 0);
    assert_eq!(CapacityPolicy::initial_capacity(40, 20, 0), 0);
}
