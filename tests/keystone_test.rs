use pop_rs::keystone::{
    crossed_keystone_boundary, first_keystone_after, highest_block_connecting_keystone_to_next,
    highest_keystone_at_or_before, is_keystone,
};

#[test]
fn keystones_are_multiples_of_the_interval_test() {
    assert!(is_keystone(0, 20));
    assert!(is_keystone(40, 20));
    assert!(!is_keystone(41, 20));
    assert!(is_keystone(15, 5));

    assert_eq!(highest_keystone_at_or_before(0, 20), 0);
    assert_eq!(highest_keystone_at_or_before(39, 20), 20);
    assert_eq!(highest_keystone_at_or_before(40, 20), 40);

    assert_eq!(first_keystone_after(0, 20), 20);
    assert_eq!(first_keystone_after(19, 20), 20);
    assert_eq!(first_keystone_after(20, 20), 40);
}

#[test]
fn highest_block_connecting_keystone_to_next_test() {
    assert_eq!(highest_block_connecting_keystone_to_next(0, 20), 21);
    assert_eq!(highest_block_connecting_keystone_to_next(20, 20), 41);
    assert_eq!(highest_block_connecting_keystone_to_next(5, 5), 11);
}

#[test]
#[should_panic]
fn highest_block_connecting_non_keystone_panics_test() {
    highest_block_connecting_keystone_to_next(21, 20);
}

#[test]
fn crossed_keystone_boundary_test() {
    // Fork at 10, tips at 15 and 12: no keystone in between with an interval of 20.
    assert!(!crossed_keystone_boundary(10, 15, 20));
    assert!(!crossed_keystone_boundary(10, 12, 20));

    assert!(crossed_keystone_boundary(19, 20, 20));
    assert!(crossed_keystone_boundary(2, 12, 5));
    assert!(!crossed_keystone_boundary(20, 39, 20));
}
