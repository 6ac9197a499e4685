//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{stationary_sequence, PacketBuilder, FRAME_PERIOD_NS};
use nalgebra::Vector3;
use vio_pipeline::FrameId;

#[test]
fn test_infrastructure_setup() {
    // Test that builders work
    let packet = PacketBuilder::new(7)
        .acc(Vector3::new(0.0, 0.0, 9.7))
        .build();

    assert_eq!(packet.frame_id, FrameId(7));
    assert_eq!(packet.timestamp, 7 * FRAME_PERIOD_NS);
    assert!(packet.has_imu());
    assert!(!packet.reinit.reinit);
}

#[test]
fn test_stationary_sequence_is_ordered() {
    let packets = stationary_sequence(0..5);
    assert_eq!(packets.len(), 5);
    assert!(packets.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}
