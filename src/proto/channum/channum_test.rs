use super::*;

#[test]
fn test_channel_number_string() {
    let n = ChannelNumber(112);
    assert_eq!(n.to_string(), "112", "bad string {n}, expected 112");
}

#[test]
fn test_channel_number_valid() {
    let tests = vec![
        (ChannelNumber(0), false),
        (ChannelNumber(MIN_CHANNEL_NUMBER - 1), false),
        (ChannelNumber(MIN_CHANNEL_NUMBER), true),
        (ChannelNumber(MIN_CHANNEL_NUMBER + 1), true),
        (ChannelNumber(MAX_CHANNEL_NUMBER), true),
        (ChannelNumber(MAX_CHANNEL_NUMBER + 1), false),
        (ChannelNumber(u16::MAX), false),
    ];

    for (n, expected) in tests {
        assert_eq!(n.valid(), expected, "unexpected validity for {n}");
    }
}
