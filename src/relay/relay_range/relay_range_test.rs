use std::net::Ipv4Addr;

use super::*;

fn new_ranges(min_port: u16, max_port: u16) -> RelayAddressGeneratorRanges {
    RelayAddressGeneratorRanges {
        relay_address: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
        min_port,
        max_port,
        max_retries: 0,
        address: "127.0.0.1".to_owned(),
    }
}

#[test]
fn test_relay_range_validate() -> Result<()> {
    let tests = vec![
        ("Valid", new_ranges(40000, 40100), Ok(())),
        ("MinPortZero", new_ranges(0, 40100), Err(Error::ErrMinPortNotZero)),
        ("MaxPortZero", new_ranges(40000, 0), Err(Error::ErrMaxPortNotZero)),
        (
            "Inverted",
            new_ranges(40100, 40000),
            Err(Error::ErrMaxPortLessThanMinPort),
        ),
        (
            "EmptyAddress",
            RelayAddressGeneratorRanges {
                address: String::new(),
                ..new_ranges(40000, 40100)
            },
            Err(Error::ErrListeningAddressInvalid),
        ),
    ];

    for (name, generator, expected) in tests {
        assert_eq!(generator.validate(), expected, "{name}");
    }

    Ok(())
}

#[tokio::test]
async fn test_relay_range_allocate_conn() -> Result<()> {
    let generator = new_ranges(41000, 41999);

    let (conn, relay_addr) = generator.allocate_conn(true, 0).await?;
    assert_eq!(relay_addr.ip(), generator.relay_address);
    assert!((41000..=41999).contains(&relay_addr.port()));
    assert_eq!(conn.local_addr()?.port(), relay_addr.port());

    Ok(())
}

#[tokio::test]
async fn test_relay_range_allocate_listener() -> Result<()> {
    let generator = new_ranges(42000, 42999);

    let (listener, relay_addr) = generator.allocate_listener(true, 0).await?;
    assert_eq!(relay_addr.ip(), generator.relay_address);
    assert!((42000..=42999).contains(&relay_addr.port()));
    assert_eq!(listener.addr().await?.port(), relay_addr.port());

    listener.close().await?;

    Ok(())
}

#[tokio::test]
async fn test_relay_range_resolves_host_names() -> Result<()> {
    let generator = RelayAddressGeneratorRanges {
        address: "localhost".to_owned(),
        ..new_ranges(44000, 44999)
    };

    let (conn, conn_addr) = generator.allocate_conn(true, 0).await?;
    assert!((44000..=44999).contains(&conn_addr.port()));
    assert_eq!(conn.local_addr()?.port(), conn_addr.port());

    let (listener, listener_addr) = generator.allocate_listener(true, 0).await?;
    assert_eq!(listener_addr.ip(), generator.relay_address);
    assert!((44000..=44999).contains(&listener_addr.port()));
    assert_eq!(listener.addr().await?.port(), listener_addr.port());

    listener.close().await?;

    Ok(())
}

#[tokio::test]
async fn test_relay_range_exhausted() -> Result<()> {
    let generator = new_ranges(43000, 43000);

    let (_held, _) = generator.allocate_conn(true, 0).await?;
    assert_eq!(
        generator.allocate_conn(true, 0).await.err(),
        Some(Error::ErrMaxRetriesExceeded)
    );

    Ok(())
}
