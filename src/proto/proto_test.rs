use super::*;

#[test]
fn test_protocol_string() {
    assert_eq!(PROTO_UDP.to_string(), "UDP");
    assert_eq!(PROTO_TCP.to_string(), "TCP");
    assert_eq!(Protocol(41).to_string(), "41");
}

#[test]
fn test_protocol_default_is_not_a_transport() {
    let p = Protocol::default();
    assert_ne!(p, PROTO_UDP);
    assert_ne!(p, PROTO_TCP);
}
